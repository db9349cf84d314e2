//! Embedded persistence for the Vellum platform.
//!
//! One SQLite database file holds everything durable: the per-document
//! delta log, snapshot roll-ups, compilation job records, and the job
//! queue's message table. The [`Database`] wrapper serializes access
//! through a mutex and runs every statement on the blocking thread pool,
//! exposing an async facade to the rest of the system.
//!
//! Hard constraints the schema enforces (rather than trusting callers):
//!
//! - `(document, version)` is the delta table's primary key, so a version
//!   race that slips past the in-memory counter surfaces as
//!   [`StorageError::DuplicateVersion`] instead of silent corruption.
//! - Queue messages survive process crashes; a claim is a row marker, not
//!   an in-memory flag, which is what makes redelivery work.

pub mod db;
pub mod delta_store;
pub mod error;
pub mod job_store;
pub mod queue_store;
pub mod records;
pub mod schema;
pub mod snapshot_store;

pub use db::Database;
pub use delta_store::DeltaStore;
pub use error::{StorageError, StorageResult};
pub use job_store::JobStore;
pub use queue_store::{QueueMessage, QueueStore};
pub use records::{DeltaRecord, JobRecord, JobStatus, SnapshotRecord};
pub use snapshot_store::SnapshotStore;
