//! Storage error types.

use thiserror::Error;
use vellum_core::DocumentKey;

/// Errors raised by persistence operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database could not be opened.
    #[error("failed to open database: {0}")]
    Open(String),

    /// A statement failed.
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// The `(document, version)` uniqueness constraint fired.
    #[error("duplicate version {version} for document {doc}")]
    DuplicateVersion {
        /// Document whose version collided.
        doc: DocumentKey,
        /// The colliding version.
        version: u64,
    },

    /// A referenced record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A stored value could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The blocking task running the statement was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
