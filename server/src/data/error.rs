//! Unified error type for the store layer.

use thiserror::Error;

/// Error returned by store operations.
///
/// Adapters map backend-specific failures onto these variants so the topic
/// runtime can react uniformly: `NotFound` and `Duplicate` are expected
/// outcomes, everything else is reported to clients as an internal error.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Requested row does not exist.
    #[error("not found")]
    NotFound,

    /// Unique constraint violated (e.g. message seq id already taken).
    #[error("duplicate")]
    Duplicate,

    /// The request itself is invalid.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Backend failure.
    #[error("store failure: {0}")]
    Unknown(String),
}

impl StoreError {
    pub fn unknown(e: impl std::fmt::Display) -> Self {
        Self::Unknown(e.to_string())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(StoreError::NotFound.to_string(), "not found");
        assert_eq!(StoreError::Duplicate.to_string(), "duplicate");
        assert_eq!(
            StoreError::unknown("disk on fire").to_string(),
            "store failure: disk on fire"
        );
    }

    #[test]
    fn test_predicates() {
        assert!(StoreError::NotFound.is_not_found());
        assert!(StoreError::Duplicate.is_duplicate());
        assert!(!StoreError::NotFound.is_duplicate());
    }
}
