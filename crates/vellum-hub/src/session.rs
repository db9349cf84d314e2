//! Session handles: one client's identity plus its bounded send queue.
//!
//! The transport (socket read/write loops) lives in the gateway; the hub
//! only sees this handle. Readers enqueue non-blocking; the owning write
//! task drains. Closing is idempotent and observable through the
//! session's cancellation token, which the transport uses to tear the
//! socket down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vellum_core::{ClientId, DocumentKey, Frame, PrincipalId, SessionId};

/// Why a non-blocking enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the backpressure policy evicts.
    Full,
    /// The session is already closed.
    Closed,
}

/// Display colors assigned round-robin by principal hash.
const COLOR_PALETTE: &[&str] = &[
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#abb2bf",
];

/// Stable display color for a principal.
#[must_use]
pub fn assign_color(principal: &PrincipalId) -> &'static str {
    let hash = principal
        .as_str()
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    COLOR_PALETTE[hash % COLOR_PALETTE.len()]
}

/// One attached client session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    doc: DocumentKey,
    principal: PrincipalId,
    client: ClientId,
    username: String,
    color: String,
    sender: mpsc::Sender<Frame>,
    closed: AtomicBool,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl SessionHandle {
    /// Create a handle plus the receiver its write task drains.
    #[must_use]
    pub fn new(
        doc: DocumentKey,
        principal: PrincipalId,
        client: ClientId,
        username: impl Into<String>,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let color = assign_color(&principal).to_owned();
        let handle = Arc::new(Self {
            id: SessionId::new(),
            doc,
            principal,
            client,
            username: username.into(),
            color,
            sender,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            connected_at: Utc::now(),
        });
        (handle, receiver)
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The room (document) this session belongs to for its lifetime.
    #[must_use]
    pub fn doc(&self) -> &DocumentKey {
        &self.doc
    }

    /// Authenticated principal.
    #[must_use]
    pub fn principal(&self) -> &PrincipalId {
        &self.principal
    }

    /// Client (device/tab) id.
    #[must_use]
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// Display name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Assigned display color.
    #[must_use]
    pub fn color(&self) -> &str {
        &self.color
    }

    /// When the session attached.
    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Token the transport watches to tear the socket down.
    #[must_use]
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue onto the outbound queue.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::Full`] at capacity, [`EnqueueError::Closed`] after
    /// close. Both mean the session must be evicted.
    pub fn try_enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the session. Idempotent; wakes the transport via the
    /// cancellation token.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }
}
