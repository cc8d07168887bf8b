//! Error types for the Arius library
//!
//! This module defines all error types that can occur while archiving to or
//! restoring from a repository. Errors fall into a few families that callers
//! handle differently:
//!
//! - **Validation** errors (malformed pointers, pointers without a binary,
//!   bad options) abort only the offending item
//! - **Transient** errors from the object store may be retried by the caller
//! - **Invariant violations** are fatal and never retried
//!
//! "Not yet hydrated" is deliberately *not* an error; see
//! [`DownloadOutcome`](crate::types::DownloadOutcome).

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Type alias for Results in the Arius library
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Main error type for all Arius operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the embedded state database
    #[error("State database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Object not found in the object store
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Object already exists and overwrite was not requested
    #[error("Object already exists: {0}")]
    ObjectAlreadyExists(String),

    /// Object is in the archive tier and cannot be read without hydration
    #[error("Object is archived and must be rehydrated first: {0}")]
    ObjectArchived(String),

    /// Transport-level failure talking to the object store
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encryption or decryption failure (wrong passphrase, tampering)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Hash mismatch during verification
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// A pointer file whose content is not a valid hash
    #[error("Invalid pointer file {path:?}: {reason}")]
    InvalidPointer {
        /// Path to the pointer file
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// A pointer file referencing a binary the repository does not know
    #[error("Pointer {path:?} references binary {hash} which is not in the repository")]
    MissingBinary {
        /// Path to the pointer file
        path: PathBuf,
        /// Referenced binary hash
        hash: String,
    },

    /// A chunk list that could not be found or decoded
    #[error("Chunk list for binary {0} is missing or corrupt")]
    InvalidChunkList(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Glob pattern parsing error
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// A programmer error or broken invariant; never retried
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// The repository has never been archived to
    #[error("Repository contains no versions")]
    RepositoryEmpty,

    /// No version exists at or before the requested instant
    #[error("No version exists at or before {0}")]
    NoVersionAt(DateTime<Utc>),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A background task panicked or was cancelled
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// The leader of a single-flight call went away without a result
    #[error("Concurrent operation on {0} was abandoned")]
    Abandoned(String),

    /// A failure produced by another task and shared with its waiters
    #[error("{0}")]
    Shared(Arc<ArchiveError>),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for ArchiveError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ArchiveError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ArchiveError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ArchiveError::Bincode(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ArchiveError {
    fn from(err: tokio::task::JoinError) -> Self {
        ArchiveError::TaskFailed(err.to_string())
    }
}

impl From<globset::Error> for ArchiveError {
    fn from(err: globset::Error) -> Self {
        ArchiveError::InvalidPattern(err.to_string())
    }
}

impl ArchiveError {
    /// Create a storage error with a custom message
    pub fn storage(msg: impl Into<String>) -> Self {
        ArchiveError::Storage(msg.into())
    }

    /// Create a crypto error with a custom message
    pub fn crypto(msg: impl Into<String>) -> Self {
        ArchiveError::Crypto(msg.into())
    }

    /// Create an invariant violation with a custom message
    pub fn invariant(msg: impl Into<String>) -> Self {
        ArchiveError::InvariantViolation(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ArchiveError::Internal(msg.into())
    }

    /// Unwrap shared errors down to the original cause
    pub fn root(&self) -> &ArchiveError {
        match self {
            ArchiveError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Check if this error only concerns a single item of a batch
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            ArchiveError::InvalidPointer { .. }
                | ArchiveError::MissingBinary { .. }
                | ArchiveError::InvalidConfiguration(_)
                | ArchiveError::InvalidPattern(_)
        )
    }

    /// Check if this error must stop the run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            ArchiveError::InvariantViolation(_) | ArchiveError::Sqlite(_)
        )
    }

    /// Check if retrying the operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            ArchiveError::Storage(_) | ArchiveError::Abandoned(_) | ArchiveError::Io(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self.root() {
            ArchiveError::Crypto(_) => {
                "Could not decrypt repository data. Check that the passphrase is correct.".to_string()
            }
            ArchiveError::MissingBinary { path, hash } => {
                format!(
                    "Pointer {:?} refers to binary {} which was never archived. \
                     Delete the pointer or restore the original file.",
                    path, hash
                )
            }
            ArchiveError::RepositoryEmpty => {
                "The repository is empty. Run 'arius archive' first.".to_string()
            }
            ArchiveError::NoVersionAt(at) => {
                format!(
                    "No version exists at or before {}. Use 'arius versions' to list versions.",
                    at
                )
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ArchiveError::ObjectNotFound("chunks/abc".to_string());
        assert_eq!(err.to_string(), "Object not found: chunks/abc");
    }

    #[test]
    fn test_shared_errors_keep_classification() {
        let inner = Arc::new(ArchiveError::invariant("hydrate twice"));
        let shared = ArchiveError::Shared(inner);
        assert!(shared.is_fatal());
        assert!(!shared.is_validation());
        assert_eq!(shared.to_string(), "Invariant violated: hydrate twice");
    }

    #[test]
    fn test_validation_errors() {
        let err = ArchiveError::InvalidPointer {
            path: PathBuf::from("a.pointer.arius"),
            reason: "not hex".to_string(),
        };
        assert!(err.is_validation());
        assert!(!err.is_fatal());
        assert!(ArchiveError::storage("throttled").is_transient());
    }
}
