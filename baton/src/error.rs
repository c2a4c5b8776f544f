//! Recoverable error taxonomy.
//!
//! None of these abort a host tool call: each has a local recovery (ephemeral
//! objects, null fields, per-key config fallback, fail-open). Command-level
//! plumbing uses `anyhow` on top of these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatonError {
    /// Persistence unreachable or failing.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// End without a start, or a parent reference to an unknown event.
    #[error("correlation miss: {0}")]
    CorrelationMiss(String),
    /// A configuration value failed validation.
    #[error("invalid value for {key}: {reason}")]
    ConfigInvalid { key: String, reason: String },
    /// A session link that would create a self-reference or a cycle.
    #[error("invalid session link: {0}")]
    InvalidLink(String),
    /// Failure inside pattern matching or violation computation.
    #[error("policy internal error: {0}")]
    PolicyInternal(String),
}

impl From<rusqlite::Error> for BatonError {
    fn from(err: rusqlite::Error) -> Self {
        BatonError::StoreUnavailable(err.to_string())
    }
}

impl BatonError {
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        BatonError::ConfigInvalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
