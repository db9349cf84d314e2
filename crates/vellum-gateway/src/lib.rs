//! The Vellum gateway daemon.
//!
//! Terminates client WebSockets (`/ws/{project}/{document}`), enforces
//! authentication and per-IP connection limits before upgrade, runs each
//! session's read/write transport loops against the hub, persists
//! document deltas through the update log, and bridges job lifecycle
//! events onto rooms as `compilation_*` frames.
//!
//! The binary (`src/main.rs`) wires this library to the rest of the
//! platform: storage, hub, bus, update log, job coordinator, retention,
//! and signal-driven graceful shutdown.

pub mod auth;
pub mod connection;
pub mod error;
pub mod events;
pub mod limiter;
pub mod server;

pub use auth::{AuthClaims, HmacTokenVerifier, TokenVerifier};
pub use error::{GatewayError, GatewayResult};
pub use limiter::{ConnectionLimiter, ConnectionPermit};
pub use server::{Gateway, GatewayContext};
