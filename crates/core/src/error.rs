//! Errors raised by aggregates and identifiers.

use thiserror::Error;

/// Result of `Aggregate::handle`, `Aggregate::restore` and friends.
pub type DomainResult<T> = Result<T, DomainError>;

/// Why an aggregate refused a command or could not be rebuilt.
///
/// Deterministic: replaying the same command against the same state yields
/// the same error. Storage and transport failures are reported by the infra
/// crate instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The command carried a value the aggregate rejects.
    #[error("validation failed: {0}")]
    Validation(String),

    /// State rebuilt from events or a snapshot is inconsistent.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command targeted a different version than the aggregate is at.
    #[error("version conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure_kind() {
        assert_eq!(
            DomainError::validation("amount must be positive").to_string(),
            "validation failed: amount must be positive"
        );
        assert_eq!(
            DomainError::conflict("expected 3, found 4").to_string(),
            "version conflict: expected 3, found 4"
        );
    }
}
