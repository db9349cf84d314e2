//! The collaboration fan-out hub.
//!
//! One [`Hub`] per server replica. Its single event loop exclusively
//! owns the document-key → room map; registration, unregistration, and
//! broadcast all serialize through it, which is what gives one room a
//! total broadcast order on one replica.
//!
//! Sessions are represented by [`SessionHandle`]s holding a bounded
//! outbound frame queue. Fan-out never blocks on a slow consumer: an
//! enqueue that would block evicts that session instead, bounding memory
//! at `queue_depth × room_size` frames.
//!
//! Rooms bridge across replicas via a [`MessageBus`]: every local
//! broadcast is also published on `room:{document_key}`, and a per-room
//! subscriber task delivers peer traffic to local sessions only. The
//! published envelope carries the replica's origin tag so a replica
//! ignores its own echo; bus outages degrade to local-only fan-out with
//! jittered resubscription.

pub mod error;
pub mod hub;
pub mod room;
pub mod session;

pub use error::{HubError, HubResult};
pub use hub::{Hub, HubHandle, HubStats};
pub use room::Room;
pub use session::{assign_color, EnqueueError, SessionHandle};
