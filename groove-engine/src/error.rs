//! Error types for groove-engine

use thiserror::Error;
use uuid::Uuid;

/// Error type for attribution and strategy operations
#[derive(Debug, Error)]
pub enum GrooveError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Embedding call exceeded its deadline
    #[error("Embedding timed out after {0}ms")]
    EmbeddingTimeout(u64),

    /// Learning not found
    #[error("Learning not found: {0}")]
    NotFound(Uuid),

    /// Event could not be interpreted
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// A write contradicted an invariant (immutable record, double assignment)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event log operation failed
    #[error("Event log error: {0}")]
    EventLog(#[from] groove_log::Error),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GrooveError {
    /// Failures worth retrying with backoff at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Embedding(_) | Self::EmbeddingTimeout(_) | Self::Io(_)
        )
    }

    /// Failures that indicate a concurrency bug and must never be swallowed.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

impl From<serde_json::Error> for GrooveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for groove operations
pub type Result<T> = std::result::Result<T, GrooveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GrooveError::Database("connection failed".into());
        assert!(err.to_string().contains("connection failed"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(GrooveError::Database("busy".into()).is_transient());
        assert!(GrooveError::EmbeddingTimeout(500).is_transient());
        assert!(!GrooveError::MalformedEvent("no session".into()).is_transient());
        assert!(!GrooveError::InvariantViolation("double write".into()).is_transient());
    }

    #[test]
    fn test_invariant_classification() {
        let err = GrooveError::InvariantViolation("arm already assigned".into());
        assert!(err.is_invariant_violation());
        assert!(!GrooveError::NotFound(Uuid::nil()).is_invariant_violation());
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: GrooveError = json_err.into();
        assert!(matches!(err, GrooveError::Serialization(_)));
    }
}
