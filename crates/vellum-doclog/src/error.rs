//! Update log error types.

use thiserror::Error;
use vellum_storage::StorageError;

/// Errors raised by update log operations.
#[derive(Debug, Error)]
pub enum DocLogError {
    /// An append carried no bytes.
    #[error("empty delta rejected")]
    EmptyDelta,

    /// An append exceeded the configured document size cap.
    #[error("delta too large: {size} bytes (max {max})")]
    DeltaTooLarge {
        /// Observed delta size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// The storage layer failed; any reserved version was rolled back.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for update log operations.
pub type DocLogResult<T> = Result<T, DocLogError>;
