//! Common error types for Tally

use thiserror::Error;

/// Common result type for Tally operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Tally services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error for stored documents
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// External call exceeded its time bound
    #[error("Timeout: {operation} exceeded {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is a store read/write problem worth retrying.
    ///
    /// Timeouts, I/O and database failures are transient. Missing records,
    /// bad input and configuration problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "sqlx")]
            Error::Database(_) => true,
            Error::Io(_) | Error::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let err = Error::Timeout {
            operation: "get_user",
            timeout_ms: 10,
        };
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Timeout: get_user exceeded 10 ms");
    }

    #[test]
    fn test_not_found_is_not_transient() {
        let err = Error::NotFound("user u1".to_string());
        assert!(!err.is_transient());
        assert!(err.is_not_found());
    }
}
