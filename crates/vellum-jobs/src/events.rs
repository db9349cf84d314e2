//! Job lifecycle events.
//!
//! The coordinator publishes these on a broadcast channel; the gateway
//! bridges them onto the owning document's room as `compilation_*`
//! frames. Delivery is best-effort: a lagging subscriber misses events,
//! and the authoritative state is always the job record.

use vellum_storage::JobRecord;

/// One job lifecycle transition.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The job began running (or was served from cache an instant later).
    Started {
        /// Snapshot of the record at transition time.
        job: JobRecord,
    },
    /// The job reached a terminal status.
    Finished {
        /// Snapshot of the record at transition time; `status`
        /// distinguishes completed, failed, timeout, and cancelled.
        job: JobRecord,
    },
}

impl JobEvent {
    /// The job record the event describes.
    #[must_use]
    pub fn job(&self) -> &JobRecord {
        match self {
            Self::Started { job } | Self::Finished { job } => job,
        }
    }
}
