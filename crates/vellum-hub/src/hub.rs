//! The hub event loop and its cloneable handle.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vellum_bus::{Backoff, MessageBus};
use vellum_core::{DocumentKey, Frame, SessionId};

use crate::error::{HubError, HubResult};
use crate::room::Room;
use crate::session::SessionHandle;

/// Depth of the hub's command channel.
const COMMAND_CHANNEL_DEPTH: usize = 1024;

/// What rides the inter-replica bus: the frame plus the publishing
/// replica's tag, so a replica can ignore its own echo.
#[derive(Debug, Serialize, Deserialize)]
struct BusEnvelope {
    origin: String,
    frame: Frame,
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Live rooms.
    pub rooms: usize,
    /// Live sessions across all rooms.
    pub sessions: usize,
}

enum HubCommand {
    Register {
        session: Arc<SessionHandle>,
    },
    Unregister {
        doc: DocumentKey,
        session: SessionId,
    },
    Broadcast {
        doc: DocumentKey,
        frame: Frame,
        exclude: Option<SessionId>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cloneable front door to the hub loop.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Attach a session to its room, synthesizing `user_joined` traffic.
    ///
    /// # Errors
    ///
    /// [`HubError::Closed`] if the hub loop is gone.
    pub async fn register(&self, session: Arc<SessionHandle>) -> HubResult<()> {
        self.tx
            .send(HubCommand::Register { session })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Detach a session, synthesizing `user_left` traffic. Idempotent.
    ///
    /// # Errors
    ///
    /// [`HubError::Closed`] if the hub loop is gone.
    pub async fn unregister(&self, doc: DocumentKey, session: SessionId) -> HubResult<()> {
        self.tx
            .send(HubCommand::Unregister { doc, session })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Fan a frame out to a room (optionally excluding one session) and
    /// publish it for peer replicas.
    ///
    /// # Errors
    ///
    /// [`HubError::Closed`] if the hub loop is gone.
    pub async fn broadcast(
        &self,
        doc: DocumentKey,
        frame: Frame,
        exclude: Option<SessionId>,
    ) -> HubResult<()> {
        self.tx
            .send(HubCommand::Broadcast {
                doc,
                frame,
                exclude,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Snapshot room/session counters.
    ///
    /// # Errors
    ///
    /// [`HubError::Closed`] or [`HubError::ReplyDropped`].
    pub async fn stats(&self) -> HubResult<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Stats { reply })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::ReplyDropped)
    }
}

struct RoomEntry {
    room: Arc<Room>,
    ingress: JoinHandle<()>,
}

/// The per-replica hub: exclusive owner of the room map.
///
/// Constructed with [`Hub::new`], then driven by spawning [`Hub::run`].
/// All interaction goes through the returned [`HubHandle`]; the loop
/// ends (tearing down every room) once all handles are dropped.
pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    self_tx: mpsc::WeakSender<HubCommand>,
    bus: Arc<dyn MessageBus>,
    origin: String,
    rooms: HashMap<DocumentKey, RoomEntry>,
}

impl Hub {
    /// Create a hub bridged over `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let hub = Self {
            rx,
            self_tx: tx.downgrade(),
            bus,
            origin: Uuid::new_v4().to_string(),
            rooms: HashMap::new(),
        };
        (hub, HubHandle { tx })
    }

    /// This replica's origin tag (diagnostics).
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Drive the event loop to completion.
    pub async fn run(mut self) {
        info!(origin = %self.origin, "hub loop started");
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Register { session } => self.handle_register(session).await,
                HubCommand::Unregister { doc, session } => {
                    self.handle_unregister(doc, session).await;
                },
                HubCommand::Broadcast {
                    doc,
                    frame,
                    exclude,
                } => {
                    self.deliver_and_publish(&doc, &frame, exclude).await;
                },
                HubCommand::Stats { reply } => {
                    let stats = HubStats {
                        rooms: self.rooms.len(),
                        sessions: self.rooms.values().map(|e| e.room.len()).sum(),
                    };
                    let _ = reply.send(stats);
                },
            }
        }

        // All handles dropped: tear everything down.
        for (doc, entry) in self.rooms.drain() {
            entry.ingress.abort();
            for session in entry.room.members() {
                session.close();
            }
            let _ = self.bus.close(&doc.channel()).await;
        }
        info!(origin = %self.origin, "hub loop stopped");
    }

    async fn handle_register(&mut self, session: Arc<SessionHandle>) {
        let doc = session.doc().clone();

        if !self.rooms.contains_key(&doc) {
            let room = Arc::new(Room::new(doc.clone()));
            let ingress = tokio::spawn(bus_ingress(
                Arc::clone(&self.bus),
                Arc::clone(&room),
                self.origin.clone(),
                self.self_tx.clone(),
            ));
            self.rooms.insert(doc.clone(), RoomEntry { room, ingress });
            info!(room = %doc, "room created");
        }

        let Some(entry) = self.rooms.get(&doc) else {
            return;
        };
        let existing = entry.room.members();
        entry.room.insert(Arc::clone(&session));
        debug!(room = %doc, session = %session.id(), members = existing.len() + 1, "session registered");

        // Replay the current roster to the newcomer only.
        for member in existing {
            let frame = Frame::joined(member.principal().clone(), member.username(), member.color());
            let _ = session.try_enqueue(frame);
        }

        // Announce the newcomer to everyone, the newcomer included.
        let joined = Frame::joined(session.principal().clone(), session.username(), session.color());
        self.deliver_and_publish(&doc, &joined, None).await;
    }

    async fn handle_unregister(&mut self, doc: DocumentKey, session_id: SessionId) {
        let removed = match self.rooms.get(&doc) {
            Some(entry) => entry.room.remove(session_id),
            None => return,
        };

        if let Some(session) = removed {
            session.close();
            debug!(room = %doc, session = %session_id, "session unregistered");
            let left = Frame::left(
                session.principal().clone(),
                Some(session.username().to_owned()),
            );
            self.deliver_and_publish(&doc, &left, Some(session_id)).await;
        }

        let now_empty = self.rooms.get(&doc).is_some_and(|e| e.room.is_empty());
        if now_empty {
            if let Some(entry) = self.rooms.remove(&doc) {
                entry.ingress.abort();
                let _ = self.bus.close(&doc.channel()).await;
                info!(room = %doc, "empty room reaped");
            }
        }
    }

    /// Local fan-out, then bus publish, then eviction bookkeeping.
    async fn deliver_and_publish(
        &self,
        doc: &DocumentKey,
        frame: &Frame,
        exclude: Option<SessionId>,
    ) {
        let Some(room) = self.rooms.get(doc).map(|e| Arc::clone(&e.room)) else {
            return;
        };

        let evicted = room.broadcast(frame, exclude);

        match serde_json::to_vec(&BusEnvelope {
            origin: self.origin.clone(),
            frame: frame.clone(),
        }) {
            Ok(payload) => {
                // Publish failures are outages: local state stays
                // consistent, peers just miss this frame.
                if let Err(e) = self.bus.publish(&doc.channel(), payload.into()).await {
                    warn!(room = %doc, error = %e, "bus publish dropped");
                }
            },
            Err(e) => warn!(room = %doc, error = %e, "frame not serializable for bus"),
        }

        self.queue_evictions(doc, evicted);
    }

    fn queue_evictions(&self, doc: &DocumentKey, evicted: Vec<Arc<SessionHandle>>) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        for session in evicted {
            let _ = tx.try_send(HubCommand::Unregister {
                doc: doc.clone(),
                session: session.id(),
            });
        }
    }
}

/// Per-room bus subscriber: delivers peer-replica frames to local
/// sessions only, reconnecting with jittered backoff.
async fn bus_ingress(
    bus: Arc<dyn MessageBus>,
    room: Arc<Room>,
    origin: String,
    hub: mpsc::WeakSender<HubCommand>,
) {
    let channel = room.doc().channel();
    let mut backoff = Backoff::default();
    loop {
        match bus.subscribe(&channel).await {
            Ok(mut subscription) => {
                debug!(channel, "bus ingress attached");
                backoff.reset();
                while let Some(payload) = subscription.recv().await {
                    let envelope: BusEnvelope = match serde_json::from_slice(&payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(channel, error = %e, "undecodable bus payload dropped");
                            continue;
                        },
                    };
                    if envelope.origin == origin {
                        // Our own publish echoed back.
                        continue;
                    }

                    // Local delivery only; never re-published.
                    let evicted = room.broadcast(&envelope.frame, None);
                    if let Some(tx) = hub.upgrade() {
                        for session in evicted {
                            let _ = tx.try_send(HubCommand::Unregister {
                                doc: room.doc().clone(),
                                session: session.id(),
                            });
                        }
                    }
                }
                debug!(channel, "bus ingress stream ended");
            },
            Err(e) => {
                warn!(channel, error = %e, "bus subscribe failed");
            },
        }
        // Hub teardown aborts this task; otherwise resubscribe.
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use vellum_bus::InProcessBus;
    use vellum_core::{ClientId, FrameKind, PrincipalId};

    fn doc() -> DocumentKey {
        DocumentKey::new("proj", "doc-a").unwrap()
    }

    fn spawn_hub() -> HubHandle {
        let (hub, handle) = Hub::new(Arc::new(InProcessBus::new()));
        tokio::spawn(hub.run());
        handle
    }

    fn session(name: &str, depth: usize) -> (Arc<SessionHandle>, Receiver<Frame>) {
        SessionHandle::new(
            doc(),
            PrincipalId::new(name),
            ClientId::new(format!("client-{name}")),
            name,
            depth,
        )
    }

    async fn recv(rx: &mut Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("session queue closed")
    }

    #[tokio::test]
    async fn register_announces_join_to_all_including_self() {
        let hub = spawn_hub();
        let (a, mut rx_a) = session("alice", 16);
        hub.register(a).await.unwrap();

        let frame = recv(&mut rx_a).await;
        assert_eq!(frame.kind, FrameKind::UserJoined);
        assert_eq!(frame.user_id, Some(PrincipalId::new("alice")));
    }

    #[tokio::test]
    async fn newcomer_receives_roster_replay() {
        let hub = spawn_hub();
        let (a, mut rx_a) = session("alice", 16);
        hub.register(a).await.unwrap();
        let _ = recv(&mut rx_a).await; // alice's own join

        let (b, mut rx_b) = session("bob", 16);
        hub.register(b).await.unwrap();

        // Bob first sees the existing roster (alice), then his own join.
        let replay = recv(&mut rx_b).await;
        assert_eq!(replay.kind, FrameKind::UserJoined);
        assert_eq!(replay.user_id, Some(PrincipalId::new("alice")));

        let own = recv(&mut rx_b).await;
        assert_eq!(own.user_id, Some(PrincipalId::new("bob")));

        // Alice sees bob join.
        let joined = recv(&mut rx_a).await;
        assert_eq!(joined.user_id, Some(PrincipalId::new("bob")));
    }

    #[tokio::test]
    async fn broadcast_excludes_the_sender() {
        let hub = spawn_hub();
        let (a, mut rx_a) = session("alice", 16);
        let (b, mut rx_b) = session("bob", 16);
        let a_id = a.id();
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        let _ = recv(&mut rx_a).await; // joins
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_b).await;
        let _ = recv(&mut rx_b).await;

        let cursor = Frame::new(FrameKind::CursorUpdate)
            .with_payload(serde_json::json!({"line": 3, "column": 7}))
            .with_user(PrincipalId::new("alice"), Some("alice".into()));
        hub.broadcast(doc(), cursor, Some(a_id)).await.unwrap();

        let received = recv(&mut rx_b).await;
        assert_eq!(received.kind, FrameKind::CursorUpdate);
        assert_eq!(received.payload.unwrap()["line"], 3);

        // The sender stays silent.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcasts_preserve_serialization_order() {
        let hub = spawn_hub();
        let (a, _rx_a) = session("alice", 16);
        let (b, mut rx_b) = session("bob", 16);
        let a_id = a.id();
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        let _ = recv(&mut rx_b).await;
        let _ = recv(&mut rx_b).await;

        for i in 0..5 {
            let frame = Frame::new(FrameKind::UserTyping)
                .with_payload(serde_json::json!({"seq": i}));
            hub.broadcast(doc(), frame, Some(a_id)).await.unwrap();
        }

        for i in 0..5 {
            let frame = recv(&mut rx_b).await;
            assert_eq!(frame.payload.unwrap()["seq"], i);
        }
    }

    #[tokio::test]
    async fn unregister_announces_leave_and_reaps_empty_room() {
        let hub = spawn_hub();
        let (a, mut rx_a) = session("alice", 16);
        let (b, mut rx_b) = session("bob", 16);
        let b_id = b.id();
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_a).await;

        hub.unregister(doc(), b_id).await.unwrap();

        let left = recv(&mut rx_a).await;
        assert_eq!(left.kind, FrameKind::UserLeft);
        assert_eq!(left.user_id, Some(PrincipalId::new("bob")));
        // The departing session's own queue saw no user_left.
        drop(rx_b);

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats, HubStats { rooms: 1, sessions: 1 });
    }

    #[tokio::test]
    async fn room_is_reaped_when_last_session_leaves() {
        let hub = spawn_hub();
        let (a, _rx_a) = session("alice", 16);
        let a_id = a.id();
        hub.register(a).await.unwrap();

        assert_eq!(hub.stats().await.unwrap(), HubStats { rooms: 1, sessions: 1 });

        hub.unregister(doc(), a_id).await.unwrap();
        assert_eq!(hub.stats().await.unwrap(), HubStats { rooms: 0, sessions: 0 });
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = spawn_hub();
        let (a, _rx_a) = session("alice", 16);
        let a_id = a.id();
        hub.register(a).await.unwrap();

        hub.unregister(doc(), a_id).await.unwrap();
        hub.unregister(doc(), a_id).await.unwrap();
        assert_eq!(hub.stats().await.unwrap(), HubStats { rooms: 0, sessions: 0 });
    }

    #[tokio::test]
    async fn overflowed_session_is_evicted_and_peers_see_left() {
        let hub = spawn_hub();
        // slow: depth 2, never drained. fast: ample headroom.
        let (slow, _rx_slow) = session("slow", 2);
        let (fast, mut rx_fast) = session("fast", 64);
        hub.register(slow).await.unwrap();
        hub.register(fast).await.unwrap();
        let _ = recv(&mut rx_fast).await; // roster replay (slow)
        let _ = recv(&mut rx_fast).await; // own join

        // slow's queue holds 2 frames (its own join + fast's join).
        // Each further broadcast overflows it.
        for i in 0..3 {
            let frame = Frame::new(FrameKind::UserTyping)
                .with_payload(serde_json::json!({"seq": i}));
            hub.broadcast(doc(), frame, None).await.unwrap();
        }

        // fast keeps receiving: the typing frames, then slow's eviction
        // surfaces as a user_left.
        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(recv(&mut rx_fast).await.kind);
        }
        assert!(kinds.contains(&FrameKind::UserLeft));
        assert_eq!(
            kinds.iter().filter(|k| **k == FrameKind::UserTyping).count(),
            3
        );

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
    }
}
