//! ISO-8601 local timestamps at the boundary.
//!
//! Timestamps are naive local time. Internally they are milliseconds on the
//! naive clock (see [`Ms`]); the conversion never consults a timezone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use crate::engine::EngineError;
use crate::model::Ms;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMAT: &str = "%Y-%m-%d";
const RENDER_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn naive_to_ms(naive: NaiveDateTime) -> Ms {
    naive.and_utc().timestamp_millis()
}

pub fn ms_to_naive(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// Parse an ISO-8601 local timestamp (`YYYY-MM-DDTHH:MM[:SS[.fff]]`).
pub fn parse_timestamp(s: &str) -> Result<Ms, EngineError> {
    let s = s.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(naive_to_ms)
        .ok_or_else(|| EngineError::InvalidTimestamp(s.to_string()))
}

/// Parse the start of a report window. A bare date means midnight.
pub fn parse_window_start(s: &str) -> Result<Ms, EngineError> {
    match NaiveDate::parse_from_str(s.trim(), DATE_FORMAT) {
        Ok(date) => Ok(naive_to_ms(date.and_time(NaiveTime::MIN))),
        Err(_) => parse_timestamp(s),
    }
}

/// Parse the end of a report window. A bare date means 23:59:59 that day.
pub fn parse_window_end(s: &str) -> Result<Ms, EngineError> {
    match NaiveDate::parse_from_str(s.trim(), DATE_FORMAT) {
        Ok(date) => date
            .and_hms_opt(23, 59, 59)
            .map(naive_to_ms)
            .ok_or_else(|| EngineError::InvalidTimestamp(s.to_string())),
        Err(_) => parse_timestamp(s),
    }
}

/// Render as `YYYY-MM-DDTHH:MM:SS`. Out-of-range values fall back to raw ms.
pub fn format_timestamp(ms: Ms) -> String {
    match ms_to_naive(ms) {
        Some(naive) => naive.format(RENDER_FORMAT).to_string(),
        None => ms.to_string(),
    }
}

/// Current naive local time.
pub fn local_now_ms() -> Ms {
    naive_to_ms(chrono::Local::now().naive_local())
}
