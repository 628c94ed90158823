pub mod booking;
pub mod mirror_cache;
pub mod queue;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("row decode error: {0}")]
    Decode(String),
}

/// Timestamps are stored as fixed-width RFC 3339 with microseconds so that
/// lexicographic ordering in SQL equals chronological ordering.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn format_date(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

pub(crate) fn format_time(value: NaiveTime) -> String {
    value.format("%H:%M").to_string()
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_date(column: &str, value: String) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|error| {
        RepositoryError::Decode(format!("invalid date in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_time(column: &str, value: String) -> Result<NaiveTime, RepositoryError> {
    NaiveTime::parse_from_str(&value, "%H:%M").map_err(|error| {
        RepositoryError::Decode(format!("invalid time in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}
