//! Type detection and column adapters
//!
//! The detector samples leading records, probes every field and keeps the
//! tightest type each column still satisfies. Adapters then map raw field
//! bytes onto typed row writes during the load phase. When a detected
//! type cannot be reconciled with an existing target column, a bad-value
//! adapter takes its place and every write fails through the atomicity
//! policy.

use crate::import::lexer::{CsvLexer, Fields, RecordMeta};
use crate::import::timestamp::TimestampParser;
use crate::storage::meta::ColumnType;
use crate::storage::table::Row;
use crate::Result;

/// Delimiters considered by auto-detection, in preference order.
pub const DELIMITER_CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];

/// A field failed its column adapter; the atomicity policy decides next.
#[derive(Debug, Clone, Copy)]
pub struct CellParseError;

type CellResult = std::result::Result<(), CellParseError>;

/// Maps raw field bytes to a typed write on one column.
pub trait ColumnAdapter: Send + Sync {
    fn column_type(&self) -> ColumnType;
    fn write(&self, row: &mut Row<'_>, column: usize, bytes: &[u8]) -> CellResult;
}

pub struct BooleanAdapter;

impl ColumnAdapter for BooleanAdapter {
    fn column_type(&self) -> ColumnType {
        ColumnType::Boolean
    }

    fn write(&self, row: &mut Row<'_>, column: usize, bytes: &[u8]) -> CellResult {
        let value = if bytes.eq_ignore_ascii_case(b"true") {
            true
        } else if bytes.eq_ignore_ascii_case(b"false") {
            false
        } else {
            return Err(CellParseError);
        };
        row.put_bool(column, value).map_err(|_| CellParseError)
    }
}

pub struct LongAdapter;

impl ColumnAdapter for LongAdapter {
    fn column_type(&self) -> ColumnType {
        ColumnType::Long
    }

    fn write(&self, row: &mut Row<'_>, column: usize, bytes: &[u8]) -> CellResult {
        let value = parse_long(bytes).ok_or(CellParseError)?;
        row.put_long(column, value).map_err(|_| CellParseError)
    }
}

pub struct DoubleAdapter;

impl ColumnAdapter for DoubleAdapter {
    fn column_type(&self) -> ColumnType {
        ColumnType::Double
    }

    fn write(&self, row: &mut Row<'_>, column: usize, bytes: &[u8]) -> CellResult {
        let value = parse_double(bytes).ok_or(CellParseError)?;
        row.put_double(column, value).map_err(|_| CellParseError)
    }
}

pub struct StringAdapter;

impl ColumnAdapter for StringAdapter {
    fn column_type(&self) -> ColumnType {
        ColumnType::String
    }

    fn write(&self, row: &mut Row<'_>, column: usize, bytes: &[u8]) -> CellResult {
        row.put_str(column, bytes).map_err(|_| CellParseError)
    }
}

pub struct SymbolAdapter;

impl ColumnAdapter for SymbolAdapter {
    fn column_type(&self) -> ColumnType {
        ColumnType::Symbol
    }

    fn write(&self, row: &mut Row<'_>, column: usize, bytes: &[u8]) -> CellResult {
        let value = std::str::from_utf8(bytes).map_err(|_| CellParseError)?;
        row.put_sym(column, value).map_err(|_| CellParseError)
    }
}

pub struct TimestampAdapter {
    parser: TimestampParser,
}

impl TimestampAdapter {
    pub fn new(parser: TimestampParser) -> Self {
        Self { parser }
    }
}

impl ColumnAdapter for TimestampAdapter {
    fn column_type(&self) -> ColumnType {
        ColumnType::Timestamp
    }

    fn write(&self, row: &mut Row<'_>, column: usize, bytes: &[u8]) -> CellResult {
        let micros = self.parser.parse(bytes).ok_or(CellParseError)?;
        row.put_timestamp(column, micros).map_err(|_| CellParseError)
    }
}

/// Stands in when a detected type cannot feed the target's timestamp (or
/// date) column; every row fails through the atomicity policy.
pub struct BadTimestampAdapter;

impl ColumnAdapter for BadTimestampAdapter {
    fn column_type(&self) -> ColumnType {
        ColumnType::Timestamp
    }

    fn write(&self, _row: &mut Row<'_>, _column: usize, _bytes: &[u8]) -> CellResult {
        Err(CellParseError)
    }
}

fn parse_long(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_double(bytes: &[u8]) -> Option<f64> {
    if bytes.is_empty() {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Build the adapter feeding `target` given the detected input type.
pub fn adapter_for(
    detected: ColumnType,
    target: ColumnType,
    parser: &TimestampParser,
) -> Box<dyn ColumnAdapter> {
    match target {
        ColumnType::Boolean => Box::new(BooleanAdapter),
        ColumnType::Double => Box::new(DoubleAdapter),
        ColumnType::String => Box::new(StringAdapter),
        ColumnType::Symbol => Box::new(SymbolAdapter),
        // a LONG target tolerates timestamp-shaped input: micros as i64
        ColumnType::Long => match detected {
            ColumnType::Timestamp => Box::new(TimestampAdapter::new(parser.clone())),
            _ => Box::new(LongAdapter),
        },
        ColumnType::Timestamp => match detected {
            ColumnType::Timestamp | ColumnType::Long => {
                Box::new(TimestampAdapter::new(parser.clone()))
            }
            _ => Box::new(BadTimestampAdapter),
        },
    }
}

// ============================================================================
// Detection
// ============================================================================

#[derive(Debug, Clone)]
pub struct DetectedColumn {
    pub name: String,
    pub ctype: ColumnType,
}

#[derive(Debug, Clone)]
pub struct DetectedSchema {
    pub columns: Vec<DetectedColumn>,
    pub has_header: bool,
}

#[derive(Debug, Clone, Copy)]
struct ProbeState {
    can_bool: bool,
    can_long: bool,
    can_double: bool,
    can_timestamp: bool,
    seen_value: bool,
}

impl ProbeState {
    fn new() -> Self {
        Self {
            can_bool: true,
            can_long: true,
            can_double: true,
            can_timestamp: true,
            seen_value: false,
        }
    }

    fn update(&mut self, bytes: &[u8], parser: &TimestampParser) {
        if bytes.is_empty() {
            return; // nulls constrain nothing
        }
        self.seen_value = true;
        self.can_bool &= bytes.eq_ignore_ascii_case(b"true") || bytes.eq_ignore_ascii_case(b"false");
        self.can_long &= parse_long(bytes).is_some();
        self.can_double &= parse_double(bytes).is_some();
        self.can_timestamp &= parser.parse(bytes).is_some();
    }

    /// Tightest type still accepted.
    fn resolve(&self) -> ColumnType {
        if !self.seen_value {
            return ColumnType::String;
        }
        if self.can_bool {
            ColumnType::Boolean
        } else if self.can_long {
            ColumnType::Long
        } else if self.can_double {
            ColumnType::Double
        } else if self.can_timestamp {
            ColumnType::Timestamp
        } else {
            ColumnType::String
        }
    }
}

fn cell_type(bytes: &[u8], parser: &TimestampParser) -> ColumnType {
    let mut state = ProbeState::new();
    state.update(bytes, parser);
    state.resolve()
}

struct DetectSink<'a> {
    parser: &'a TimestampParser,
    max_lines: usize,
    rows_seen: usize,
    first_row: Vec<Vec<u8>>,
    states: Vec<ProbeState>,
}

impl<'a> crate::import::lexer::RecordSink for DetectSink<'a> {
    fn on_record(&mut self, _meta: RecordMeta, fields: &Fields<'_>) -> Result<()> {
        if self.rows_seen >= self.max_lines {
            return Ok(());
        }
        if self.rows_seen == 0 {
            self.first_row = fields.iter().map(|f| f.to_vec()).collect();
        } else {
            while self.states.len() < fields.len() {
                self.states.push(ProbeState::new());
            }
            for (i, field) in fields.iter().enumerate() {
                self.states[i].update(field, self.parser);
            }
        }
        self.rows_seen += 1;
        Ok(())
    }
}

/// Sample `buf` and infer column names and types.
///
/// The first record is a header iff all of its cells read as strings and
/// at least one column's type inferred from the remaining records
/// differs; `force_header` overrides the heuristic.
pub fn detect_schema(
    buf: &[u8],
    delimiter: u8,
    max_lines: usize,
    force_header: bool,
    eof: bool,
    parser: &TimestampParser,
) -> Result<DetectedSchema> {
    let mut lexer = CsvLexer::new(delimiter);
    lexer.restart(0, 0, false);
    let mut sink = DetectSink {
        parser,
        max_lines,
        rows_seen: 0,
        first_row: Vec::new(),
        states: Vec::new(),
    };
    lexer.parse(buf, &mut sink)?;
    if eof {
        // only a buffer covering the whole file may have a trailing
        // record without a newline; otherwise the tail is truncated
        lexer.parse_last(&mut sink)?;
    }

    let first_types: Vec<ColumnType> = sink
        .first_row
        .iter()
        .map(|f| cell_type(f, parser))
        .collect();

    let has_header = if sink.rows_seen == 0 {
        false
    } else if force_header {
        true
    } else if sink.rows_seen < 2 {
        false
    } else {
        let all_stringy = first_types.iter().all(|t| *t == ColumnType::String);
        let any_differs = sink.states.iter().enumerate().any(|(i, s)| {
            s.resolve() != first_types.get(i).copied().unwrap_or(ColumnType::String)
        });
        all_stringy && any_differs
    };

    let mut states = sink.states;
    if !has_header && !sink.first_row.is_empty() {
        while states.len() < sink.first_row.len() {
            states.push(ProbeState::new());
        }
        for (i, field) in sink.first_row.iter().enumerate() {
            states[i].update(field, parser);
        }
    }

    let column_count = states.len().max(sink.first_row.len());
    let mut columns = Vec::with_capacity(column_count);
    for i in 0..column_count {
        let name = if has_header {
            sink.first_row
                .get(i)
                .and_then(|f| std::str::from_utf8(f).ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("f{i}"))
        } else {
            format!("f{i}")
        };
        let ctype = states
            .get(i)
            .map(|s| s.resolve())
            .unwrap_or(ColumnType::String);
        columns.push(DetectedColumn { name, ctype });
    }

    Ok(DetectedSchema {
        columns,
        has_header,
    })
}

/// Choose the column delimiter that splits sampled lines most consistently.
pub fn detect_delimiter(buf: &[u8]) -> u8 {
    let mut best = b',';
    let mut best_score = 0.0f64;
    let lines: Vec<&[u8]> = buf
        .split(|&b| b == b'\n')
        .filter(|l| !l.is_empty())
        .take(10)
        .collect();
    if lines.is_empty() {
        return best;
    }
    for &candidate in &DELIMITER_CANDIDATES {
        let counts: Vec<usize> = lines
            .iter()
            .map(|l| l.iter().filter(|&&b| b == candidate).count())
            .collect();
        let total: usize = counts.iter().sum();
        if total == 0 {
            continue;
        }
        let mean = total as f64 / counts.len() as f64;
        let variance = counts
            .iter()
            .map(|&c| (c as f64 - mean) * (c as f64 - mean))
            .sum::<f64>()
            / counts.len() as f64;
        // reward frequency, punish inconsistency across lines
        let score = mean / (1.0 + variance);
        if score > best_score {
            best_score = score;
            best = candidate;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(buf: &[u8]) -> DetectedSchema {
        detect_schema(buf, b',', 1000, false, true, &TimestampParser::default()).unwrap()
    }

    #[test]
    fn test_header_detected() {
        let schema = detect(b"ts,price,active\n2022-01-01T00:00:00Z,1.5,true\n");
        assert!(schema.has_header);
        assert_eq!(schema.columns[0].name, "ts");
        assert_eq!(schema.columns[0].ctype, ColumnType::Timestamp);
        assert_eq!(schema.columns[1].ctype, ColumnType::Double);
        assert_eq!(schema.columns[2].ctype, ColumnType::Boolean);
    }

    #[test]
    fn test_no_header_when_first_row_typed() {
        let schema = detect(b"1,2.5\n3,4.5\n");
        assert!(!schema.has_header);
        assert_eq!(schema.columns[0].name, "f0");
        assert_eq!(schema.columns[0].ctype, ColumnType::Long);
        assert_eq!(schema.columns[1].ctype, ColumnType::Double);
    }

    #[test]
    fn test_all_string_rows_are_not_header() {
        // no column differs from the first row, so it is data
        let schema = detect(b"abc,def\nghi,jkl\n");
        assert!(!schema.has_header);
        assert_eq!(schema.columns[0].ctype, ColumnType::String);
    }

    #[test]
    fn test_force_header() {
        let schema =
            detect_schema(b"1,2\n3,4\n", b',', 1000, true, true, &TimestampParser::default())
                .unwrap();
        assert!(schema.has_header);
        assert_eq!(schema.columns[0].name, "1");
        assert_eq!(schema.columns[0].ctype, ColumnType::Long);
    }

    #[test]
    fn test_tightest_type_widens() {
        let schema = detect(b"1,true\n2.5,false\nx,maybe\n");
        assert_eq!(schema.columns[0].ctype, ColumnType::String);
        assert_eq!(schema.columns[1].ctype, ColumnType::String);
        let schema = detect(b"1\n2.5\n3\n");
        assert_eq!(schema.columns[0].ctype, ColumnType::Double);
    }

    #[test]
    fn test_empty_cells_do_not_widen() {
        let schema = detect(b"1,\n,true\n2,false\n");
        assert_eq!(schema.columns[0].ctype, ColumnType::Long);
        assert_eq!(schema.columns[1].ctype, ColumnType::Boolean);
    }

    #[test]
    fn test_delimiter_detection() {
        assert_eq!(detect_delimiter(b"a,b,c\n1,2,3\n"), b',');
        assert_eq!(detect_delimiter(b"a;b;c\n1;2;3\n"), b';');
        assert_eq!(detect_delimiter(b"a\tb\n1\t2\n"), b'\t');
        assert_eq!(detect_delimiter(b"a|b\n1|2\n"), b'|');
        // inconsistent commas lose to consistent semicolons
        assert_eq!(detect_delimiter(b"a;b,c,d\n1;2\n3;4\n"), b';');
    }

    #[test]
    fn test_long_target_tolerates_timestamp_input() {
        let adapter = adapter_for(
            ColumnType::Timestamp,
            ColumnType::Long,
            &TimestampParser::default(),
        );
        assert_eq!(adapter.column_type(), ColumnType::Timestamp);
    }

    #[test]
    fn test_string_into_timestamp_target_is_bad() {
        let adapter = adapter_for(
            ColumnType::String,
            ColumnType::Timestamp,
            &TimestampParser::default(),
        );
        // bad adapter fails every write
        assert_eq!(adapter.column_type(), ColumnType::Timestamp);
    }
}
