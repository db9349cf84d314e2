//! The client wire protocol: a typed, timestamped JSON envelope.
//!
//! Every message on a client WebSocket, and every message mirrored on the
//! inter-replica bus, is one [`Frame`]: `{type, payload?, timestamp,
//! user_id?, username?}`. The `type` tag partitions into presence,
//! transport, document, and job frames; payloads are type-specific JSON
//! objects and opaque binary fields inside them travel as base64 strings.
//!
//! Frames are size-bounded at [`MAX_FRAME_BYTES`]. Unknown `type` tags
//! decode to [`FrameKind::Unknown`] rather than failing, so the dispatch
//! layer can answer with a typed `error` frame instead of dropping the
//! message silently.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{JobId, PrincipalId};

/// Maximum serialized frame size: 512 KiB.
pub const MAX_FRAME_BYTES: usize = 512 * 1024;

/// Well-known `error` frame codes.
pub mod codes {
    /// The frame `type` tag was not recognized.
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    /// The payload did not match the expected shape for its frame type.
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    /// A document update was rejected (empty, oversized, or unpersistable).
    pub const UPDATE_REJECTED: &str = "update_rejected";
}

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// A session joined the room (server-synthesized).
    UserJoined,
    /// A session left the room (server-synthesized).
    UserLeft,
    /// A user is typing.
    UserTyping,
    /// Cursor position moved.
    CursorUpdate,
    /// Selection range changed.
    Selection,
    /// An opaque document delta (persisted, then relayed).
    DocumentUpdate,
    /// A generic CRDT delta (persisted, then relayed).
    YjsUpdate,
    /// A presence-adjacent CRDT delta (relayed, not persisted).
    YjsAwareness,
    /// A compilation job began running.
    CompilationStarted,
    /// A compilation job completed successfully.
    CompilationCompleted,
    /// A compilation job failed or timed out.
    CompilationFailed,
    /// Client liveness probe.
    Ping,
    /// Liveness probe response.
    Pong,
    /// Typed per-message fault report.
    Error,
    /// Any tag this server does not recognize.
    #[serde(other)]
    Unknown,
}

impl FrameKind {
    /// Presence frames: joined/left/typing.
    #[must_use]
    pub fn is_presence(self) -> bool {
        matches!(self, Self::UserJoined | Self::UserLeft | Self::UserTyping)
    }

    /// Document frames: cursor/selection/deltas/awareness.
    #[must_use]
    pub fn is_document(self) -> bool {
        matches!(
            self,
            Self::CursorUpdate | Self::Selection | Self::DocumentUpdate | Self::YjsUpdate | Self::YjsAwareness
        )
    }

    /// Frames carrying an opaque delta that must be persisted before relay.
    #[must_use]
    pub fn is_persisted_update(self) -> bool {
        matches!(self, Self::DocumentUpdate | Self::YjsUpdate)
    }

    /// Job lifecycle frames.
    #[must_use]
    pub fn is_job(self) -> bool {
        matches!(
            self,
            Self::CompilationStarted | Self::CompilationCompleted | Self::CompilationFailed
        )
    }
}

/// The wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Frame type tag (wire field `type`).
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Type-specific payload object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Wall-clock stamp; the server re-stamps inbound frames.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Originating principal (server-stamped).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<PrincipalId>,
    /// Display name of the originator, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Frame {
    /// Create a bare frame of the given kind, stamped now.
    #[must_use]
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            payload: None,
            timestamp: Utc::now(),
            user_id: None,
            username: None,
        }
    }

    /// Attach a payload object.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Stamp originator identity.
    #[must_use]
    pub fn with_user(mut self, user_id: PrincipalId, username: Option<String>) -> Self {
        self.user_id = Some(user_id);
        self.username = username;
        self
    }

    /// Server-synthesized `user_joined` frame.
    ///
    /// # Panics
    ///
    /// Never panics: [`PresencePayload`] serialization is infallible.
    #[must_use]
    pub fn joined(user_id: PrincipalId, username: impl Into<String>, color: impl Into<String>) -> Self {
        let payload = serde_json::to_value(PresencePayload {
            color: Some(color.into()),
        })
        .unwrap_or(serde_json::Value::Null);
        Self::new(FrameKind::UserJoined)
            .with_payload(payload)
            .with_user(user_id, Some(username.into()))
    }

    /// Server-synthesized `user_left` frame.
    #[must_use]
    pub fn left(user_id: PrincipalId, username: Option<String>) -> Self {
        Self::new(FrameKind::UserLeft).with_user(user_id, username)
    }

    /// `pong` response to a client `ping`.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(FrameKind::Pong)
    }

    /// Typed `error` frame.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        let payload = serde_json::to_value(ErrorPayload {
            code: code.into(),
            message: message.into(),
        })
        .unwrap_or(serde_json::Value::Null);
        Self::new(FrameKind::Error).with_payload(payload)
    }

    /// Job lifecycle frame carrying a [`CompilationEventPayload`].
    #[must_use]
    pub fn compilation(kind: FrameKind, payload: &CompilationEventPayload) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        Self::new(kind).with_payload(payload)
    }

    /// Serialize to the JSON wire form, enforcing the size bound.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Oversized`] if the serialized frame exceeds
    /// [`MAX_FRAME_BYTES`]; [`ProtocolError::Malformed`] on a
    /// non-serializable payload.
    pub fn encode(&self) -> ProtocolResult<String> {
        let json = serde_json::to_string(self)?;
        if json.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::Oversized {
                size: json.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        Ok(json)
    }

    /// Decode a frame from raw wire bytes, enforcing the size bound first.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Oversized`] before any parsing if the input is too
    /// large; [`ProtocolError::Malformed`] if the bytes are not a valid
    /// envelope.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::Oversized {
                size: bytes.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse this frame's payload into a typed shape.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::EmptyPayload`] if the frame has no payload;
    /// [`ProtocolError::Malformed`] if the payload does not match `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> ProtocolResult<T> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| ProtocolError::EmptyPayload(format!("{:?}", self.kind)))?;
        Ok(serde_json::from_value(payload)?)
    }
}

/// Payload of server-synthesized presence frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    /// Display color assigned to the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Payload of `error` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code (see [`codes`]).
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Payload of `document_update` / `yjs_update` frames.
///
/// The delta itself is opaque; it crosses the wire base64-encoded. The
/// `version` field is absent on client-to-server frames and stamped with
/// the server-assigned version on relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// Base64-encoded opaque delta bytes.
    pub update: String,
    /// Server-assigned monotone version (relay direction only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl UpdatePayload {
    /// Wrap raw delta bytes for the wire.
    #[must_use]
    pub fn from_bytes(delta: &[u8]) -> Self {
        Self {
            update: BASE64.encode(delta),
            version: None,
        }
    }

    /// Decode the opaque delta bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidBase64`] if the field is not valid base64.
    pub fn bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(BASE64.decode(&self.update)?)
    }
}

/// Payload of `compilation_*` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationEventPayload {
    /// The job this event describes.
    pub job_id: JobId,
    /// Terminal or current status, as its snake_case name.
    pub status: String,
    /// Object-store key of the produced artifact, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    /// Object-store key of the build log, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_key: Option<String>,
    /// Extracted error text for failed builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the result was served from the content-hash cache.
    #[serde(default)]
    pub cached: bool,
    /// Build duration in milliseconds, for terminal states.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
