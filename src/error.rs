//! Error types for the TSS subsystem.
//!
//! "Not enough evidence yet" is never an error: validation and threshold checks
//! report it as an empty result. Errors are reserved for misuse (signing before
//! readiness, reading an uninitialized cache) and infrastructure failures.

use thiserror::Error;

/// TSS error type.
#[derive(Error, Debug)]
pub enum TssError {
    // Key store errors
    #[error("Key material already exists for sequence {id} at {path}")]
    AlreadyExists { id: u64, path: String },

    #[error("Corrupt or missing key: {0}")]
    CorruptKey(String),

    #[error("I/O error: {0}")]
    Io(String),

    // Lifecycle errors
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    // Threshold errors
    #[error("Insufficient shares: need {needed}, have {have}")]
    InsufficientShares { needed: usize, have: usize },

    // Crypto engine errors
    #[error("Crypto engine error: {0}")]
    Crypto(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Gossip submission errors
    #[error("Submission failed: {0}")]
    Submission(String),

    // Input validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TssError {
    /// Stable code for structured log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::CorruptKey(_) => "CORRUPT_KEY",
            Self::Io(_) => "IO_FAILURE",
            Self::NotReady(_) => "NOT_READY",
            Self::NotInitialized(_) => "NOT_INITIALIZED",
            Self::InsufficientShares { .. } => "INSUFFICIENT_SHARES",
            Self::Crypto(_) => "CRYPTO_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Submission(_) => "SUBMISSION_FAILED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Deserialization(_) => "DESERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the condition clears on its own once more protocol data arrives.
    ///
    /// Callers retry these on the next round instead of surfacing them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotReady(_) | Self::NotInitialized(_) | Self::InsufficientShares { .. }
        )
    }
}

// Conversion from common error types

impl From<std::io::Error> for TssError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TssError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<redb::Error> for TssError {
    fn from(err: redb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for TssError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for TssError {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for TssError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for TssError {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for TssError {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TssError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Blocking task failed: {err}"))
    }
}

/// Result type alias for TSS operations.
pub type TssResult<T> = Result<T, TssError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TssError::AlreadyExists {
                id: 7,
                path: "7/private.key".to_string()
            }
            .error_code(),
            "ALREADY_EXISTS"
        );
        assert_eq!(
            TssError::NotReady("test".to_string()).error_code(),
            "NOT_READY"
        );
        assert_eq!(
            TssError::Internal("test".to_string()).error_code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(TssError::NotInitialized("keys".to_string()).is_transient());
        assert!(TssError::InsufficientShares { needed: 6, have: 5 }.is_transient());
        assert!(!TssError::Io("disk".to_string()).is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: TssError = std::io::Error::other("boom").into();
        assert!(matches!(err, TssError::Io(_)));
    }
}
