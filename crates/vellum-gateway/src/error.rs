//! Gateway error types.

use thiserror::Error;

/// Errors raised by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The presented token failed verification.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The upgrade request was malformed (bad path, missing document).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The source IP is at its connection cap.
    #[error("connection limit reached for {0}")]
    TooManyConnections(std::net::IpAddr),

    /// Listener or socket I/O failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The WebSocket layer failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
