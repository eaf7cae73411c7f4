//! Derived columns.
//!
//! `transaction_date` is the calendar date of `transaction_time` and `partition_key` is
//! its year-month as `YYYYMM`. Both are pure functions of the row, evaluated once when
//! the row is materialized; evaluating them again always yields the same answer.
//!
//! ## Best-effort timestamp parsing
//!
//! Accepted shapes, tried in order:
//! - `2019-01-01 00:00:18` (optionally with fractional seconds)
//! - `2019-01-01T00:00:18` and RFC 3339 with an offset (wall-clock date is kept)
//! - `2019/01/01 00:00:18`
//! - `21/06/2020 12:14[:00]` (day first)
//! - `2019-01-01`
//! - integral unix seconds
//!
//! Anything else maps to the zero date `1970-01-01`, so a garbled timestamp lands in
//! partition `197001` instead of failing the whole batch.

use crate::row::Row;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedColumns {
    pub transaction_date: NaiveDate,
    pub partition_key: u32,
}

pub fn derive(row: &Row) -> DerivedColumns {
    let transaction_date = transaction_date(&row.transaction_time);
    DerivedColumns {
        transaction_date,
        partition_key: partition_key(transaction_date),
    }
}

/// Date truncation of a best-effort-parsed timestamp; the zero date when unparseable.
pub fn transaction_date(raw: &str) -> NaiveDate {
    parse_best_effort(raw)
        .map(|ts| ts.date())
        .unwrap_or_default()
}

/// `YYYYMM` of a date.
pub fn partition_key(date: NaiveDate) -> u32 {
    date.year().max(0) as u32 * 100 + date.month()
}

pub fn parse_best_effort(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts);
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.naive_local());
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = s.parse().ok()?;
        return DateTime::from_timestamp(secs, 0).map(|ts| ts.naive_utc());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::sample_row;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_common_shapes() {
        assert_eq!(transaction_date("2019-01-01 00:00:18"), date(2019, 1, 1));
        assert_eq!(transaction_date("2020-06-21 12:14:25.123"), date(2020, 6, 21));
        assert_eq!(transaction_date("2020-06-21T23:59:59"), date(2020, 6, 21));
        assert_eq!(transaction_date("2020-06-21T23:59:59+05:00"), date(2020, 6, 21));
        assert_eq!(transaction_date("2020/06/21 01:02:03"), date(2020, 6, 21));
        assert_eq!(transaction_date("21/06/2020 12:14"), date(2020, 6, 21));
        assert_eq!(transaction_date("2020-06-21"), date(2020, 6, 21));
        assert_eq!(transaction_date("1546300818"), date(2019, 1, 1));
    }

    #[test]
    fn test_unparseable_maps_to_zero_date() {
        assert_eq!(transaction_date("yesterday"), date(1970, 1, 1));
        assert_eq!(transaction_date(""), date(1970, 1, 1));
        assert_eq!(partition_key(transaction_date("garbage")), 197001);
    }

    #[test]
    fn test_partition_key() {
        assert_eq!(partition_key(date(2019, 1, 31)), 201901);
        assert_eq!(partition_key(date(2020, 12, 1)), 202012);
    }

    #[test]
    fn test_derive_is_idempotent() {
        let row = sample_row("CA", "gas_transport", 80.0);
        let first = derive(&row);
        let second = derive(&row);
        assert_eq!(first, second);
        assert_eq!(first.partition_key, 201901);
    }
}
