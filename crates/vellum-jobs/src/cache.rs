//! Content-hash cache index.
//!
//! Read-through only: population happens as a side effect of `completed`
//! transitions persisting job records, so the "index" is the job store's
//! fingerprint query with TTL and enable switches applied.

use tracing::debug;
use vellum_storage::{JobRecord, JobStore};

use crate::error::JobResult;

/// Fingerprint → completed-job lookup.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    jobs: JobStore,
    enabled: bool,
    ttl: Option<chrono::Duration>,
}

impl CacheIndex {
    /// Create an index over the job store.
    ///
    /// `ttl` of `None` means cached results never age out.
    #[must_use]
    pub fn new(jobs: JobStore, enabled: bool, ttl: Option<std::time::Duration>) -> Self {
        Self {
            jobs,
            enabled,
            ttl: ttl.and_then(|t| chrono::Duration::from_std(t).ok()),
        }
    }

    /// The most recent completed job matching `fingerprint`, if caching
    /// is enabled and the hit is fresh enough.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn lookup(&self, fingerprint: &str) -> JobResult<Option<JobRecord>> {
        if !self.enabled {
            return Ok(None);
        }
        let hit = self
            .jobs
            .latest_completed_by_fingerprint(fingerprint, self.ttl)
            .await?;
        if let Some(job) = &hit {
            debug!(fingerprint, job = %job.id, "cache hit");
        }
        Ok(hit)
    }
}
