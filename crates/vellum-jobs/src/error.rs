//! Job system error types.

use thiserror::Error;
use vellum_core::{JobId, PrincipalId};
use vellum_storage::{JobStatus, StorageError};
use vellum_worker::WorkerError;

/// Errors raised by the job system.
#[derive(Debug, Error)]
pub enum JobError {
    /// The principal already has the maximum number of active jobs.
    #[error("principal {principal} exceeds active job limit ({limit})")]
    AdmissionLimitExceeded {
        /// The submitting principal.
        principal: PrincipalId,
        /// The configured cap.
        limit: usize,
    },

    /// The referenced job does not exist.
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    /// A status transition outside the DAG was attempted.
    #[error("illegal job transition {from} -> {to} for {job}")]
    InvalidTransition {
        /// The job whose transition was refused.
        job: JobId,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },

    /// An artifact key tried to escape the store root.
    #[error("unsafe artifact key: {0}")]
    UnsafeKey(String),

    /// Artifact I/O failed.
    #[error("artifact store error: {0}")]
    Artifact(#[from] std::io::Error),

    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Input preparation or sandbox launch failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Result type for job system operations.
pub type JobResult<T> = Result<T, JobError>;
