//! Streaming CSV tokenizer
//!
//! A push-based state machine over raw bytes. Callers feed arbitrary
//! buffer slices; records and fields may straddle buffers, so field bytes
//! accumulate in an internal reusable buffer and sinks receive views into
//! it. Inside double quotes, delimiters and newlines are literal and a
//! quote escapes itself by doubling. A `\r` immediately before `\n` is
//! discarded.

use crate::Result;

const QUOTE: u8 = b'"';

/// Position and shape of one parsed record.
#[derive(Debug, Clone, Copy)]
pub struct RecordMeta {
    /// Zero-based line number of the record start.
    pub line_number: u64,
    /// Absolute byte offset of the record start in the input.
    pub offset: u64,
    /// Record length in bytes, including the terminating newline.
    pub byte_len: u32,
}

/// Borrowed view over the fields of one record.
pub struct Fields<'a> {
    buf: &'a [u8],
    bounds: &'a [(u32, u32)],
}

impl<'a> Fields<'a> {
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn get(&self, i: usize) -> &'a [u8] {
        let (start, end) = self.bounds[i];
        &self.buf[start as usize..end as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// Receives parsed records. Errors abort the parse and propagate.
pub trait RecordSink {
    fn on_record(&mut self, meta: RecordMeta, fields: &Fields<'_>) -> Result<()>;
}

impl<F> RecordSink for F
where
    F: FnMut(RecordMeta, &Fields<'_>) -> Result<()>,
{
    fn on_record(&mut self, meta: RecordMeta, fields: &Fields<'_>) -> Result<()> {
        self(meta, fields)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    FieldStart,
    InField,
    InQuoted,
    QuoteInQuoted,
}

pub struct CsvLexer {
    delimiter: u8,
    skip_lines_with_extra_values: bool,
    expected_field_count: Option<usize>,

    state: LexState,
    /// Unquoted content of the current record.
    line_buf: Vec<u8>,
    /// Field ranges into `line_buf`.
    bounds: Vec<(u32, u32)>,
    field_start: u32,
    pending_cr: bool,
    skip_first_record: bool,

    /// Absolute offset of the next input byte.
    offset: u64,
    /// Absolute offset of the current record start.
    record_offset: u64,
    line_number: u64,
    /// Records dropped because they carried more fields than expected.
    overflow_count: u64,
}

impl CsvLexer {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            skip_lines_with_extra_values: true,
            expected_field_count: None,
            state: LexState::FieldStart,
            line_buf: Vec::new(),
            bounds: Vec::new(),
            field_start: 0,
            pending_cr: false,
            skip_first_record: false,
            offset: 0,
            record_offset: 0,
            line_number: 0,
            overflow_count: 0,
        }
    }

    pub fn set_skip_lines_with_extra_values(&mut self, skip: bool) {
        self.skip_lines_with_extra_values = skip;
    }

    pub fn set_expected_field_count(&mut self, count: Option<usize>) {
        self.expected_field_count = count;
    }

    /// Reset parsing state to start at `offset` / `line_number`; when
    /// `skip_first_record` is set the next record is consumed silently
    /// (header handling).
    pub fn restart(&mut self, offset: u64, line_number: u64, skip_first_record: bool) {
        self.state = LexState::FieldStart;
        self.line_buf.clear();
        self.bounds.clear();
        self.field_start = 0;
        self.pending_cr = false;
        self.skip_first_record = skip_first_record;
        self.offset = offset;
        self.record_offset = offset;
        self.line_number = line_number;
        self.overflow_count = 0;
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Feed one buffer; complete records are emitted to `sink`.
    pub fn parse(&mut self, buf: &[u8], sink: &mut dyn RecordSink) -> Result<()> {
        for &b in buf {
            self.step(b, sink)?;
        }
        Ok(())
    }

    /// Feed bytes until one record has been emitted (or the buffer ends).
    /// Returns true when a record was emitted.
    pub fn parse_one(&mut self, buf: &[u8], sink: &mut dyn RecordSink) -> Result<bool> {
        let before = self.line_number;
        for &b in buf {
            self.step(b, sink)?;
            if self.line_number > before {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Emit a trailing record that has no final newline.
    pub fn parse_last(&mut self, sink: &mut dyn RecordSink) -> Result<()> {
        self.pending_cr = false;
        if self.state != LexState::FieldStart || !self.line_buf.is_empty() || !self.bounds.is_empty()
        {
            self.end_record(sink)?;
        }
        Ok(())
    }

    fn step(&mut self, b: u8, sink: &mut dyn RecordSink) -> Result<()> {
        self.offset += 1;
        match self.state {
            LexState::FieldStart => match b {
                QUOTE => {
                    self.flush_pending_cr();
                    self.state = LexState::InQuoted;
                }
                b'\n' => return self.end_record(sink),
                b'\r' => self.pending_cr = true,
                _ if b == self.delimiter => {
                    self.flush_pending_cr();
                    self.end_field();
                }
                _ => {
                    self.flush_pending_cr();
                    self.line_buf.push(b);
                    self.state = LexState::InField;
                }
            },
            LexState::InField => match b {
                b'\n' => return self.end_record(sink),
                b'\r' => self.pending_cr = true,
                _ if b == self.delimiter => {
                    self.flush_pending_cr();
                    self.end_field();
                    self.state = LexState::FieldStart;
                }
                _ => {
                    self.flush_pending_cr();
                    self.line_buf.push(b);
                }
            },
            LexState::InQuoted => match b {
                QUOTE => self.state = LexState::QuoteInQuoted,
                _ => self.line_buf.push(b),
            },
            LexState::QuoteInQuoted => match b {
                QUOTE => {
                    // doubled quote is a literal quote
                    self.line_buf.push(QUOTE);
                    self.state = LexState::InQuoted;
                }
                b'\n' => return self.end_record(sink),
                b'\r' => {
                    self.pending_cr = true;
                    self.state = LexState::InField;
                }
                _ if b == self.delimiter => {
                    self.end_field();
                    self.state = LexState::FieldStart;
                }
                _ => {
                    // stray byte after a closing quote; keep it as data
                    self.line_buf.push(b);
                    self.state = LexState::InField;
                }
            },
        }
        Ok(())
    }

    #[inline]
    fn flush_pending_cr(&mut self) {
        if self.pending_cr {
            self.line_buf.push(b'\r');
            self.pending_cr = false;
        }
    }

    fn end_field(&mut self) {
        self.bounds.push((self.field_start, self.line_buf.len() as u32));
        self.field_start = self.line_buf.len() as u32;
    }

    fn end_record(&mut self, sink: &mut dyn RecordSink) -> Result<()> {
        self.pending_cr = false;
        self.end_field();

        let meta = RecordMeta {
            line_number: self.line_number,
            offset: self.record_offset,
            byte_len: (self.offset - self.record_offset) as u32,
        };
        let empty_record = self.bounds.len() == 1 && self.bounds[0].0 == self.bounds[0].1;
        let overflow = self
            .expected_field_count
            .map(|n| self.bounds.len() > n)
            .unwrap_or(false);

        let mut emit = !empty_record;
        if self.skip_first_record && emit {
            self.skip_first_record = false;
            emit = false;
        } else if overflow {
            if self.skip_lines_with_extra_values {
                self.overflow_count += 1;
                emit = false;
            } else {
                self.bounds.truncate(self.expected_field_count.unwrap());
            }
        }

        let result = if emit {
            sink.on_record(
                meta,
                &Fields {
                    buf: &self.line_buf,
                    bounds: &self.bounds,
                },
            )
        } else {
            Ok(())
        };

        self.line_buf.clear();
        self.bounds.clear();
        self.field_start = 0;
        self.state = LexState::FieldStart;
        self.line_number += 1;
        self.record_offset = self.offset;
        result
    }
}
