//! Database model definitions and row conversion helpers.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Persisted scheduler timing (single row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerConfigRecord {
    pub tick_interval_secs: u64,
    pub recheck_interval_secs: u64,
    pub claim_retry_limit: u32,
    pub claim_retry_backoff_ms: u64,
    pub watchdog_check_interval_ms: u64,
    pub watchdog_failure_threshold: u32,
}

impl Default for SchedulerConfigRecord {
    fn default() -> Self {
        Self {
            tick_interval_secs: 15,
            recheck_interval_secs: 5,
            claim_retry_limit: 15,
            claim_retry_backoff_ms: 1000,
            watchdog_check_interval_ms: 2000,
            watchdog_failure_threshold: 20,
        }
    }
}

/// Read a JSON encoded TEXT column.
pub(super) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a unix timestamp column as a UTC date-time.
pub(super) fn datetime_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    pvr_protocol::timestamp_to_datetime(secs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}
