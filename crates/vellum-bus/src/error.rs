//! Bus error types.

use thiserror::Error;

/// Errors raised by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus backend is unreachable.
    #[error("bus connection failed: {0}")]
    Connection(String),

    /// A publish could not be delivered to the backend.
    #[error("publish to {channel} failed: {reason}")]
    Publish {
        /// Channel the publish targeted.
        channel: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// The channel subscription has been closed.
    #[error("subscription to {0} closed")]
    Closed(String),
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
