//! Error types for Strata

use thiserror::Error;

/// Main error type for Strata operations
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Invalid input rejected before any state change (bad permanence,
    /// bad type argument, confirm on an episode)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lookup for an id that does not exist
    #[error("Not found: {0} {1}")]
    NotFound(&'static str, String),

    /// Storage-boundary constraint violation (duplicate active fact,
    /// duplicate link)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Caller is not allowed to perform the operation (cross-tenant
    /// access without elevation)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Database errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Extraction agent errors that warrant another attempt (malformed
    /// response, transport failure, timeout)
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                MemoryError::Constraint(
                    msg.clone().unwrap_or_else(|| "constraint violation".to_string()),
                )
            }
            _ => MemoryError::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::Serialization(err.to_string())
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::Validation("unknown permanence 'forever'".to_string());
        assert_eq!(err.to_string(), "Validation error: unknown permanence 'forever'");

        let err = MemoryError::NotFound("fact", "abc".to_string());
        assert_eq!(err.to_string(), "Not found: fact abc");
    }

    #[test]
    fn test_constraint_violation_maps_to_constraint() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: facts.tenant".to_string()),
        );
        let err: MemoryError = sqlite_err.into();
        assert!(matches!(err, MemoryError::Constraint(_)));
    }
}
