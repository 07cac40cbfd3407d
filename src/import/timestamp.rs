//! Timestamp field parsing
//!
//! All timestamps resolve to epoch microseconds, UTC. Without an explicit
//! format the parser probes a fixed list of common shapes; a pure-digit
//! field is taken as epoch micros. Naive datetimes are read as UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;

/// Formats probed, in order, when no explicit format is configured.
static PROBE_FORMATS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S%.f",
    ]
});

static PROBE_DATE_FORMATS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["%Y-%m-%d", "%Y/%m/%d"]);

/// Parses one timestamp shape; cloneable so every worker carries its own.
#[derive(Debug, Clone, Default)]
pub struct TimestampParser {
    format: Option<String>,
}

impl TimestampParser {
    pub fn new(format: Option<String>) -> Self {
        Self { format }
    }

    /// Parse a raw field to epoch micros; `None` when the field does not
    /// conform.
    pub fn parse(&self, bytes: &[u8]) -> Option<i64> {
        let text = std::str::from_utf8(bytes).ok()?;
        if text.is_empty() {
            return None;
        }
        match &self.format {
            Some(format) => Self::parse_with_format(text, format),
            None => Self::probe(text),
        }
    }

    fn parse_with_format(text: &str, format: &str) -> Option<i64> {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.timestamp_micros());
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.and_utc().timestamp_micros());
        }
        if let Ok(d) = NaiveDate::parse_from_str(text, format) {
            return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros());
        }
        None
    }

    fn probe(text: &str) -> Option<i64> {
        if text.bytes().all(|b| b.is_ascii_digit())
            || (text.starts_with('-') && text.len() > 1 && text[1..].bytes().all(|b| b.is_ascii_digit()))
        {
            return text.parse::<i64>().ok();
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.timestamp_micros());
        }
        for &format in PROBE_FORMATS.iter() {
            if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
                return Some(dt.and_utc().timestamp_micros());
            }
        }
        for &format in PROBE_DATE_FORMATS.iter() {
            if let Ok(d) = NaiveDate::parse_from_str(text, format) {
                return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micros(s: &str) -> i64 {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
            .timestamp_micros()
    }

    #[test]
    fn test_probe_shapes() {
        let p = TimestampParser::default();
        let expect = micros("2022-01-01 00:00:00");
        assert_eq!(p.parse(b"2022-01-01T00:00:00Z"), Some(expect));
        assert_eq!(p.parse(b"2022-01-01T00:00:00"), Some(expect));
        assert_eq!(p.parse(b"2022-01-01 00:00:00"), Some(expect));
        assert_eq!(p.parse(b"2022-01-01"), Some(expect));
        assert_eq!(p.parse(expect.to_string().as_bytes()), Some(expect));
    }

    #[test]
    fn test_probe_fractional_seconds() {
        let p = TimestampParser::default();
        let base = micros("2022-01-01 00:00:00");
        assert_eq!(p.parse(b"2022-01-01T00:00:00.000123Z"), Some(base + 123));
        assert_eq!(p.parse(b"2022-01-01 00:00:00.5"), Some(base + 500_000));
    }

    #[test]
    fn test_explicit_format() {
        let p = TimestampParser::new(Some("%d/%m/%Y %H:%M".to_string()));
        assert_eq!(p.parse(b"17/05/2022 13:45"), Some(micros("2022-05-17 13:45:00")));
        // format is strict; probes are not consulted
        assert_eq!(p.parse(b"2022-05-17T13:45:00Z"), None);
    }

    #[test]
    fn test_rejects_garbage_and_empty() {
        let p = TimestampParser::default();
        assert_eq!(p.parse(b""), None);
        assert_eq!(p.parse(b"not-a-time"), None);
        assert_eq!(p.parse(b"12.5"), None);
        assert_eq!(p.parse(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_timezone_offset_normalized() {
        let p = TimestampParser::default();
        assert_eq!(
            p.parse(b"2022-01-01T02:00:00+02:00"),
            Some(micros("2022-01-01 00:00:00"))
        );
    }
}
