//! Error types for the shared data model.

use thiserror::Error;

/// Errors raised when building or parsing model values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Rule kind string is not ONCE or SERIES.
    #[error("Invalid rule kind: {0}")]
    InvalidRuleKind(String),

    /// A rule lacks the identity its kind requires.
    #[error("Rule {rule} is missing {field}")]
    MissingField { rule: String, field: &'static str },

    /// Timestamp outside the representable range.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}
