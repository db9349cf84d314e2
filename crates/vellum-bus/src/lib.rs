//! Inter-replica pub/sub bus for room fan-out.
//!
//! Each document room maps to one bus channel (`room:{document_key}`).
//! A hub publishes every locally-serialized frame to the room's channel
//! and subscribes to receive frames originating on peer replicas.
//!
//! Delivery is best-effort at-most-once; ordering within a channel is
//! preserved by the underlying broadcast primitive. The [`MessageBus`]
//! trait is the seam for an external broker adapter; the shipped
//! [`InProcessBus`] carries traffic between hubs inside one process and
//! doubles as the multi-replica test vehicle.

pub mod backoff;
pub mod bus;
pub mod error;
pub mod memory;

pub use backoff::Backoff;
pub use bus::{BusSubscription, MessageBus};
pub use error::{BusError, BusResult};
pub use memory::InProcessBus;
