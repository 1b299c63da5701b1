use std::error::Error as StdError;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AbidError {
    #[error("{type_name}.abid_prefix must be defined to derive identifiers (suggested: {suggested})")]
    MissingPrefix { type_name: String, suggested: String },
    #[error("invalid abid prefix {raw:?}: {reason}")]
    InvalidPrefix { raw: String, reason: String },
    #[error("malformed identifier {input:?}: {reason}")]
    Malformed { input: String, reason: String },
    #[error("timestamp {0} cannot be encoded in an abid")]
    TimestampOutOfRange(String),
}

pub(crate) fn malformed(input: &str, reason: impl Into<String>) -> AbidError {
    AbidError::Malformed { input: input.to_string(), reason: reason.into() }
}

/// Failures reported by a [`crate::backfill::BackfillStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("uniqueness violation: {0}")]
    UniqueViolation(String),
    #[error("unsupported storage layout: {0}")]
    Layout(String),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}
