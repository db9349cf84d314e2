//! One document's session set and local fan-out.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;
use vellum_core::{DocumentKey, Frame, SessionId};

use crate::session::SessionHandle;

/// In-memory set of sessions subscribed to one document key.
///
/// Mutations and fan-out serialize on the session-set lock: broadcast
/// walks the set under the read lock, so an adjacent register/unregister
/// waits for the pass to finish.
#[derive(Debug)]
pub struct Room {
    doc: DocumentKey,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    created_at: DateTime<Utc>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(doc: DocumentKey) -> Self {
        Self {
            doc,
            sessions: RwLock::new(HashMap::new()),
            created_at: Utc::now(),
        }
    }

    /// The document this room serves.
    #[must_use]
    pub fn doc(&self) -> &DocumentKey {
        &self.doc
    }

    /// When the room was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Add a session (unique by id).
    pub fn insert(&self, session: Arc<SessionHandle>) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(session.id(), session);
    }

    /// Remove a session by id, returning its handle if present.
    pub fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&id)
    }

    /// Number of attached sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the room has no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current members.
    #[must_use]
    pub fn members(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Arc::clone)
            .collect()
    }

    /// Fan a frame out to every session, optionally excluding one, in a
    /// single pass under the read lock.
    ///
    /// Delivery is a non-blocking enqueue. Sessions whose queue is full
    /// or already closed are closed and returned for the hub to
    /// unregister; a stuck subscriber never stalls the room.
    pub fn broadcast(&self, frame: &Frame, exclude: Option<SessionId>) -> Vec<Arc<SessionHandle>> {
        let mut evicted = Vec::new();
        {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            for (id, session) in sessions.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                if session.try_enqueue(frame.clone()).is_err() {
                    evicted.push(Arc::clone(session));
                }
            }
        }

        for session in &evicted {
            debug!(doc = %self.doc, session = %session.id(), "session evicted by backpressure");
            session.close();
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use vellum_core::{ClientId, FrameKind, PrincipalId};

    fn doc() -> DocumentKey {
        DocumentKey::new("p", "d").unwrap()
    }

    fn session(name: &str, depth: usize) -> (Arc<SessionHandle>, mpsc::Receiver<Frame>) {
        SessionHandle::new(
            doc(),
            PrincipalId::new(name),
            ClientId::new(format!("c-{name}")),
            name,
            depth,
        )
    }

    #[tokio::test]
    async fn broadcast_reaches_all_members() {
        let room = Room::new(doc());
        let (a, mut rx_a) = session("a", 8);
        let (b, mut rx_b) = session("b", 8);
        room.insert(a);
        room.insert(b);
        assert_eq!(room.len(), 2);

        let evicted = room.broadcast(&Frame::pong(), None);
        assert!(evicted.is_empty());
        assert_eq!(rx_a.recv().await.unwrap().kind, FrameKind::Pong);
        assert_eq!(rx_b.recv().await.unwrap().kind, FrameKind::Pong);
    }

    #[tokio::test]
    async fn exclusion_skips_the_sender() {
        let room = Room::new(doc());
        let (a, mut rx_a) = session("a", 8);
        let (b, mut rx_b) = session("b", 8);
        let a_id = a.id();
        room.insert(a);
        room.insert(b);

        room.broadcast(&Frame::pong(), Some(a_id));

        assert_eq!(rx_b.recv().await.unwrap().kind, FrameKind::Pong);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn single_session_self_broadcast_is_silent() {
        let room = Room::new(doc());
        let (a, mut rx_a) = session("a", 8);
        let a_id = a.id();
        room.insert(a);

        let evicted = room.broadcast(&Frame::pong(), Some(a_id));
        assert!(evicted.is_empty());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowing_session_is_evicted_others_continue() {
        let room = Room::new(doc());
        // "slow" never drains a 2-deep queue; "fast" has headroom.
        let (slow, _rx_slow) = session("slow", 2);
        let (fast, mut rx_fast) = session("fast", 16);
        let slow_id = slow.id();
        room.insert(Arc::clone(&slow));
        room.insert(fast);

        room.broadcast(&Frame::pong(), None);
        room.broadcast(&Frame::pong(), None);
        // Third frame overflows the slow session.
        let evicted = room.broadcast(&Frame::pong(), None);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), slow_id);
        assert!(slow.is_closed());

        // The fast session got all three and keeps receiving.
        room.broadcast(&Frame::pong(), None);
        for _ in 0..4 {
            assert_eq!(rx_fast.recv().await.unwrap().kind, FrameKind::Pong);
        }
    }

    #[tokio::test]
    async fn remove_returns_the_handle() {
        let room = Room::new(doc());
        let (a, _rx) = session("a", 4);
        let a_id = a.id();
        room.insert(a);

        let removed = room.remove(a_id).unwrap();
        assert_eq!(removed.id(), a_id);
        assert!(room.is_empty());
        assert!(room.remove(a_id).is_none());
    }
}
