//! Persistent record types shared by the update log and job system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vellum_core::{ClientId, DocumentKey, JobId, PrincipalId};

/// One immutable document delta, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRecord {
    /// Document this delta belongs to.
    pub doc: DocumentKey,
    /// Server-assigned version, dense and monotone per document.
    pub version: u64,
    /// Opaque delta bytes.
    pub payload: Vec<u8>,
    /// Originating principal.
    pub principal: PrincipalId,
    /// Originating client (device/tab).
    pub client: ClientId,
    /// Wall-clock sequencer.
    pub created_at: DateTime<Utc>,
}

impl DeltaRecord {
    /// Payload size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }
}

/// One immutable snapshot roll-up, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Document this snapshot summarizes.
    pub doc: DocumentKey,
    /// Version at which the snapshot was taken.
    pub version: u64,
    /// Opaque snapshot bytes.
    pub snapshot: Vec<u8>,
    /// Opaque state-vector bytes.
    pub state_vector: Vec<u8>,
    /// Number of deltas folded into this snapshot.
    pub update_count: u64,
    /// When the snapshot was produced.
    pub created_at: DateTime<Utc>,
}

/// Compilation job status.
///
/// Transitions form a DAG: `queued → running → {completed, failed,
/// timeout, cancelled}`, with `queued → cancelled` as the only terminal
/// transition allowed before `started_at` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue.
    Queued,
    /// Claimed and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// The engine exited non-zero.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
    /// The wall-clock deadline expired.
    Timeout,
}

impl JobStatus {
    /// Canonical snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    /// Parse a canonical name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Whether this status admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Whether `self → to` is a legal transition.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        match (self, to) {
            (Self::Queued, Self::Running | Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled) => {
                true
            },
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compilation job, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier.
    pub id: JobId,
    /// Document the job compiles.
    pub doc: DocumentKey,
    /// Submitting principal.
    pub principal: PrincipalId,
    /// Engine selector (opaque to the core).
    pub engine: String,
    /// Entry point file name.
    pub entry: String,
    /// Hex SHA-256 fingerprint of the input set.
    pub fingerprint: String,
    /// Scheduling priority (higher first; informational).
    pub priority: i64,
    /// Current status.
    pub status: JobStatus,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// When a worker began executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Object-store key of the produced artifact.
    pub result_key: Option<String>,
    /// Object-store key of the build log.
    pub log_key: Option<String>,
    /// Extracted error text for failed builds.
    pub error: Option<String>,
    /// Whether the result was served from the content-hash cache.
    pub cached: bool,
}

impl JobRecord {
    /// Create a fresh queued job.
    #[must_use]
    pub fn new(
        doc: DocumentKey,
        principal: PrincipalId,
        engine: impl Into<String>,
        entry: impl Into<String>,
        fingerprint: impl Into<String>,
        priority: i64,
    ) -> Self {
        Self {
            id: JobId::new(),
            doc,
            principal,
            engine: engine.into(),
            entry: entry.into(),
            fingerprint: fingerprint.into(),
            priority,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result_key: None,
            log_key: None,
            error: None,
            cached: false,
        }
    }
}

/// Versions are `u64` in the API and `INTEGER` (i64) in SQLite; real
/// version numbers never approach the sign boundary.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn version_to_db(v: u64) -> i64 {
    v as i64
}

/// See [`version_to_db`].
#[allow(clippy::cast_sign_loss)]
pub(crate) fn version_from_db(v: i64) -> u64 {
    v as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Timeout,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("exploded"), None);
    }

    #[test]
    fn transition_dag() {
        use JobStatus::{Cancelled, Completed, Failed, Queued, Running, Timeout};

        assert!(Queued.can_transition(Running));
        assert!(Queued.can_transition(Cancelled));
        assert!(!Queued.can_transition(Completed));

        for terminal in [Completed, Failed, Timeout, Cancelled] {
            assert!(Running.can_transition(terminal));
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition(Running));
            assert!(!terminal.can_transition(Queued));
        }

        assert!(!Running.can_transition(Queued));
    }

    #[test]
    fn new_job_is_queued_without_timestamps() {
        let job = JobRecord::new(
            DocumentKey::new("p", "main.tex").unwrap(),
            PrincipalId::new("u1"),
            "pdflatex",
            "main.tex",
            "ab".repeat(32),
            0,
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(!job.cached);
    }
}
