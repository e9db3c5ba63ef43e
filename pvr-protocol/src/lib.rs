//! Shared data model for the pvr recording scheduler.
//!
//! This crate defines the values that flow between the rule store, the
//! scheduler, the recorders and the post-processing workers:
//!
//! - [`RecordingRule`]: persisted user intent (ONCE or SERIES) with its
//!   ordered post-processing [`Task`]s
//! - [`ShowAiring`]: one guide listing on a [`Channel`]
//! - [`Recording`]: a captured or in-progress file with its
//!   [`Commercial`] breaks
//! - [`RecordedShow`]: ledger entry preventing duplicate captures
//!
//! # Example
//!
//! ```rust
//! use pvr_protocol::{Channel, RecordingRule, RuleKind};
//!
//! let rule = RecordingRule::series("rule-1", "Evening Drama", "series-42", Channel::new("5"));
//! assert_eq!(rule.kind, RuleKind::Series);
//! assert!(rule.validate().is_ok());
//! ```

pub mod error;
pub mod types;

pub use error::ModelError;
pub use types::{
    Channel, Commercial, RecordedShow, Recording, RecordingRule, RuleKind, ShowAiring, Task, Topic,
    WorkerInfo,
};

/// Convert a unix timestamp (seconds) into a UTC date-time.
pub fn timestamp_to_datetime(secs: i64) -> Result<chrono::DateTime<chrono::Utc>, ModelError> {
    chrono::DateTime::from_timestamp(secs, 0).ok_or(ModelError::InvalidTimestamp(secs))
}
