//! Core types for the Vellum collaborative document platform.
//!
//! This crate is dependency-light on purpose: every other Vellum crate
//! speaks in the types defined here. It contains:
//!
//! - Typed identifiers ([`DocumentKey`], [`SessionId`], [`PrincipalId`],
//!   [`ClientId`], [`JobId`]) so that a project name can never be passed
//!   where a session id is expected.
//! - The wire [`Frame`] envelope and its [`FrameKind`] tag set: the JSON
//!   protocol spoken over client WebSockets and mirrored verbatim on the
//!   inter-replica bus.
//! - Protocol limits and the [`ProtocolError`] taxonomy for transport-level
//!   faults.
//!
//! Opaque binary payloads (CRDT deltas, snapshots, state vectors) are never
//! interpreted here; inside JSON they travel as base64 strings via the
//! helpers in [`frame`].

pub mod error;
pub mod frame;
pub mod ids;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::codes;
pub use frame::{
    CompilationEventPayload, ErrorPayload, Frame, FrameKind, PresencePayload, UpdatePayload,
    MAX_FRAME_BYTES,
};
pub use ids::{ClientId, DocumentKey, JobId, PrincipalId, SessionId};
