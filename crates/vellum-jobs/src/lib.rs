//! The compilation job system: durable queue, cache index, coordinator.
//!
//! Jobs are at-least-once: a claimed-but-unacked message is redelivered
//! after the visibility timeout, and duplicate work is masked by the
//! content-hash cache. The [`JobCoordinator`] owns every job's status
//! transitions, drives the bounded worker pool, and publishes lifecycle
//! events the gateway turns into `compilation_*` frames.
//!
//! Layout:
//!
//! - [`queue`]: blocking claim/ack over the durable message table.
//! - [`cache`]: fingerprint to completed-job lookup (read-through only).
//! - [`artifacts`]: object-store seam (put/get/delete/list) with a
//!   filesystem implementation.
//! - [`events`]: job lifecycle broadcast.
//! - [`coordinator`]: dispatch, status machine, shutdown.

pub mod artifacts;
pub mod cache;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod queue;

pub use artifacts::{input_key, input_prefix, log_key, result_key, ArtifactStore, FsArtifactStore};
pub use cache::CacheIndex;
pub use coordinator::{CoordinatorConfig, JobCoordinator};
pub use error::{JobError, JobResult};
pub use events::JobEvent;
pub use queue::JobQueue;
