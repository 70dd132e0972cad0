//! Lenient date parsing for the two upstreams.
//!
//! The Chamber emits ISO 8601 (`2024-11-05T00:00:00`), the Senate emits
//! `dd/mm/yyyy`, and both occasionally emit garbage. Unparsable input becomes
//! [`UNKNOWN`] instead of failing the record.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const UNKNOWN: &str = "unknown";

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%Y/%m/%d"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalDate {
    Known(NaiveDate),
    Unknown,
}

impl CanonicalDate {
    pub fn parse(raw: &str) -> Self {
        match parse_datetime(raw) {
            Some(dt) => CanonicalDate::Known(dt.date()),
            None => CanonicalDate::Unknown,
        }
    }

    pub fn year(&self) -> Option<i32> {
        match self {
            CanonicalDate::Known(date) => Some(date.year()),
            CanonicalDate::Unknown => None,
        }
    }
}

impl fmt::Display for CanonicalDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalDate::Known(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            CanonicalDate::Unknown => f.write_str(UNKNOWN),
        }
    }
}

impl Serialize for CanonicalDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CanonicalDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(CanonicalDate::parse(&raw))
    }
}

/// Date-time variant used for roll-call sessions. Date-only input is
/// accepted and lands at midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalTimestamp {
    Known(NaiveDateTime),
    Unknown,
}

impl CanonicalTimestamp {
    pub fn parse(raw: &str) -> Self {
        match parse_datetime(raw) {
            Some(dt) => CanonicalTimestamp::Known(dt),
            None => CanonicalTimestamp::Unknown,
        }
    }

    pub fn date(&self) -> CanonicalDate {
        match self {
            CanonicalTimestamp::Known(dt) => CanonicalDate::Known(dt.date()),
            CanonicalTimestamp::Unknown => CanonicalDate::Unknown,
        }
    }
}

impl fmt::Display for CanonicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalTimestamp::Known(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
            CanonicalTimestamp::Unknown => f.write_str(UNKNOWN),
        }
    }
}

impl Serialize for CanonicalTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CanonicalTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(CanonicalTimestamp::parse(&raw))
    }
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case(UNKNOWN) {
        return None;
    }
    // Offsets are dropped: the wall-clock date is what the chamber recorded.
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> CanonicalDate {
        CanonicalDate::Known(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn accepts_both_upstream_formats() {
        assert_eq!(CanonicalDate::parse("05/11/2024"), ymd(2024, 11, 5));
        assert_eq!(CanonicalDate::parse("05-11-2024"), ymd(2024, 11, 5));
        assert_eq!(CanonicalDate::parse("2024-11-05"), ymd(2024, 11, 5));
        assert_eq!(CanonicalDate::parse("2024-11-05T00:00:00"), ymd(2024, 11, 5));
        assert_eq!(CanonicalDate::parse("2024-11-05T23:10:00-03:00"), ymd(2024, 11, 5));
        assert_eq!(CanonicalDate::parse(" 2024-11-05T10:00:00.000 "), ymd(2024, 11, 5));
    }

    #[test]
    fn garbage_becomes_unknown() {
        assert_eq!(CanonicalDate::parse(""), CanonicalDate::Unknown);
        assert_eq!(CanonicalDate::parse("31/02/2024"), CanonicalDate::Unknown);
        assert_eq!(CanonicalDate::parse("sin fecha"), CanonicalDate::Unknown);
        assert_eq!(CanonicalDate::Unknown.to_string(), "unknown");
    }

    #[test]
    fn canonical_strings() {
        assert_eq!(ymd(2024, 1, 9).to_string(), "2024-01-09");
        let ts = CanonicalTimestamp::parse("03/12/2024 11:25");
        assert_eq!(ts.to_string(), "2024-12-03T11:25:00");
        assert_eq!(ts.date(), ymd(2024, 12, 3));
        assert_eq!(CanonicalTimestamp::parse("?").to_string(), "unknown");
    }

    #[test]
    fn serde_uses_canonical_strings() {
        let json = serde_json::to_string(&ymd(2024, 3, 1)).unwrap();
        assert_eq!(json, "\"2024-03-01\"");
        let back: CanonicalDate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ymd(2024, 3, 1));
        let unknown: CanonicalDate = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(unknown, CanonicalDate::Unknown);
    }
}
