//! The document update log: Vellum's durable record of collaboration.
//!
//! Every accepted document delta is appended here with a server-assigned
//! version: a monotone, dense, per-document integer. Versions are handed
//! out under a per-document mutex whose counter is lazily seeded from
//! storage and rolled back when persistence fails, so the persisted
//! sequence never has gaps.
//!
//! Every S versions (default 100) a snapshot roll-up is produced in the
//! background; reconnecting clients are served the latest snapshot plus
//! the delta tail via [`UpdateLog::updates_for_client`]. Old deltas are
//! reclaimed by an age-based sweep; snapshots keep the latest K.
//!
//! Payloads are opaque. The log never interprets CRDT bytes; it counts,
//! stores, and returns them.

pub mod error;
pub mod log;
pub mod retention;
pub mod snapshotter;
pub mod sync;
mod version;

pub use error::{DocLogError, DocLogResult};
pub use log::{DocLogConfig, UpdateLog};
pub use retention::run_retention;
pub use snapshotter::{RollupSnapshotter, SnapshotProducer};
pub use sync::SyncResponse;
