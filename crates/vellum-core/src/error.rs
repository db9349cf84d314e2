//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while encoding, decoding, or validating wire frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame exceeded the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    Oversized {
        /// Observed frame size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        max: usize,
    },

    /// The frame body was not valid JSON or did not match the envelope.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// An identifier failed validation.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A required payload was missing or empty.
    #[error("empty payload for frame type {0}")]
    EmptyPayload(String),

    /// An opaque binary field was not valid base64.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
