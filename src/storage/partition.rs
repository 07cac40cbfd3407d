//! Partition units and directory naming
//!
//! A partition key is the canonical start timestamp of a partition, in
//! epoch microseconds, floored to the partition unit in UTC. Directory
//! names are the human-readable rendering of the key and must round-trip
//! through `parse_dir_name`.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StrataError};

/// Partition unit of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionBy {
    Year,
    Month,
    Day,
    Hour,
}

impl PartitionBy {
    /// Floor `ts_micros` to the start of its partition, in UTC.
    pub fn floor(&self, ts_micros: i64) -> i64 {
        let dt = micros_to_datetime(ts_micros);
        let floored = match self {
            PartitionBy::Year => Utc
                .with_ymd_and_hms(dt.year(), 1, 1, 0, 0, 0)
                .single()
                .expect("valid year start"),
            PartitionBy::Month => Utc
                .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .single()
                .expect("valid month start"),
            PartitionBy::Day => Utc
                .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
                .single()
                .expect("valid day start"),
            PartitionBy::Hour => Utc
                .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), dt.hour(), 0, 0)
                .single()
                .expect("valid hour start"),
        };
        floored.timestamp_micros()
    }

    /// Canonical directory name for a partition key.
    pub fn format_dir_name(&self, key: i64) -> String {
        let dt = micros_to_datetime(key);
        match self {
            PartitionBy::Year => dt.format("%Y").to_string(),
            PartitionBy::Month => dt.format("%Y-%m").to_string(),
            PartitionBy::Day => dt.format("%Y-%m-%d").to_string(),
            PartitionBy::Hour => dt.format("%Y-%m-%dT%H").to_string(),
        }
    }

    /// Parse a directory name produced by `format_dir_name` back to its key.
    pub fn parse_dir_name(&self, name: &str) -> Result<i64> {
        let bad = || StrataError::InvalidPartitionName(name.to_string());
        let dt: NaiveDateTime = match self {
            PartitionBy::Year => {
                let year: i32 = name.parse().map_err(|_| bad())?;
                NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(bad)?.into()
            }
            PartitionBy::Month => NaiveDate::parse_from_str(&format!("{name}-01"), "%Y-%m-%d")
                .map_err(|_| bad())?
                .into(),
            PartitionBy::Day => NaiveDate::parse_from_str(name, "%Y-%m-%d")
                .map_err(|_| bad())?
                .into(),
            PartitionBy::Hour => NaiveDateTime::parse_from_str(&format!("{name}:00"), "%Y-%m-%dT%H:%M")
                .map_err(|_| bad())?,
        };
        let key = dt.and_utc().timestamp_micros();
        if self.format_dir_name(key) != name {
            return Err(bad());
        }
        Ok(key)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PartitionBy::Year => "YEAR",
            PartitionBy::Month => "MONTH",
            PartitionBy::Day => "DAY",
            PartitionBy::Hour => "HOUR",
        }
    }
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_micros(0).unwrap())
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
    fn test_floor_units() {
        let ts = micros("2022-05-17 13:45:59");
        assert_eq!(PartitionBy::Hour.floor(ts), micros("2022-05-17 13:00:00"));
        assert_eq!(PartitionBy::Day.floor(ts), micros("2022-05-17 00:00:00"));
        assert_eq!(PartitionBy::Month.floor(ts), micros("2022-05-01 00:00:00"));
        assert_eq!(PartitionBy::Year.floor(ts), micros("2022-01-01 00:00:00"));
    }

    #[test]
    fn test_dir_name_round_trip() {
        let ts = micros("2022-05-17 13:45:59");
        for unit in [
            PartitionBy::Year,
            PartitionBy::Month,
            PartitionBy::Day,
            PartitionBy::Hour,
        ] {
            let key = unit.floor(ts);
            let name = unit.format_dir_name(key);
            assert_eq!(unit.parse_dir_name(&name).unwrap(), key, "unit {unit:?}");
        }
        assert_eq!(PartitionBy::Day.format_dir_name(micros("2022-05-17 00:00:00")), "2022-05-17");
        assert_eq!(PartitionBy::Hour.format_dir_name(micros("2022-05-17 13:00:00")), "2022-05-17T13");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PartitionBy::Day.parse_dir_name("2022-5-17").is_err());
        assert!(PartitionBy::Day.parse_dir_name("banana").is_err());
        assert!(PartitionBy::Hour.parse_dir_name("2022-05-17").is_err());
    }

    #[test]
    fn test_floor_is_idempotent() {
        let ts = micros("1999-12-31 23:59:59");
        for unit in [PartitionBy::Year, PartitionBy::Month, PartitionBy::Day, PartitionBy::Hour] {
            let key = unit.floor(ts);
            assert_eq!(unit.floor(key), key);
        }
    }
}
