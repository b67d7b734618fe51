//! Error types used throughout the pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for Sentinel.
#[derive(Error, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum SentinelError {
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SentinelError {
    /// Whether a later attempt against the same dependency could succeed.
    ///
    /// Drives the retry classifier: transient errors are retried under
    /// backoff and counted by the circuit breaker; everything else is
    /// unretryable and dead-letters immediately. `Unavailable` means a
    /// breaker is already refusing calls, so retrying would only burn
    /// budget.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SentinelError::Network(_) | SentinelError::Storage(_))
    }
}

/// Result type alias for Sentinel operations.
pub type Result<T> = std::result::Result<T, SentinelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SentinelError::Network("timeout".into()).is_transient());
        assert!(SentinelError::Storage("locked".into()).is_transient());
        assert!(!SentinelError::InvalidInput("bad payload".into()).is_transient());
        assert!(!SentinelError::Unavailable("circuit open".into()).is_transient());
        assert!(!SentinelError::NotFound("record".into()).is_transient());
    }

    #[test]
    fn serializes_with_type_tag() {
        let err = SentinelError::Network("connection refused".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "Network");
        assert_eq!(json["message"], "connection refused");
    }
}
