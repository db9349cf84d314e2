//! Hub error types.

use thiserror::Error;

/// Errors raised by hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub event loop is gone (shutdown in progress).
    #[error("hub is not running")]
    Closed,

    /// A reply from the hub loop was dropped.
    #[error("hub reply dropped")]
    ReplyDropped,
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;
