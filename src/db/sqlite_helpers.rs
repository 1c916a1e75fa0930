//! SQLite helper utilities for timestamp conversion
//!
//! SQLite has no native timestamp type. Timestamps are stored as RFC 3339 text
//! with nanosecond precision so file modification times survive a round trip
//! and compare exactly against what the filesystem reports.

use std::time::SystemTime;

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};

/// Get current timestamp as an RFC 3339 string
#[inline]
pub fn now_iso8601() -> String {
    datetime_to_str(Utc::now())
}

/// Convert a chrono DateTime to an RFC 3339 string
#[inline]
pub fn datetime_to_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 string to DateTime
pub fn str_to_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's datetime() format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
                .map_err(|e| anyhow!("Invalid datetime '{}': {}", s, e))
        })
}

/// Convert a filesystem timestamp to DateTime
#[inline]
pub fn system_time_to_datetime(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}
