//! The [`UpdateLog`] itself: versioned append plus snapshot scheduling.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vellum_core::{ClientId, DocumentKey, PrincipalId};
use vellum_storage::{
    Database, DeltaRecord, DeltaStore, SnapshotRecord, SnapshotStore,
};

use crate::error::{DocLogError, DocLogResult};
use crate::snapshotter::{RollupSnapshotter, SnapshotProducer};
use crate::version::VersionCounters;

/// Tunables for the update log.
#[derive(Debug, Clone)]
pub struct DocLogConfig {
    /// Produce a snapshot every this many versions.
    pub snapshot_interval: u64,
    /// Cap on deltas returned by one sync fetch.
    pub max_updates_per_fetch: usize,
    /// Cap on a single delta's size in bytes.
    pub max_delta_bytes: usize,
    /// Snapshots retained per document.
    pub snapshot_keep: usize,
}

impl Default for DocLogConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
            max_updates_per_fetch: 1000,
            max_delta_bytes: 10 * 1024 * 1024,
            snapshot_keep: 5,
        }
    }
}

/// Durable, versioned store of document deltas and snapshots.
pub struct UpdateLog {
    deltas: DeltaStore,
    snapshots: SnapshotStore,
    counters: VersionCounters,
    producer: Arc<dyn SnapshotProducer>,
    config: DocLogConfig,
    snapshot_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UpdateLog {
    /// Build an update log over the shared database with the default
    /// roll-up snapshotter.
    #[must_use]
    pub fn new(db: Database, config: DocLogConfig) -> Self {
        Self::with_producer(db, config, Arc::new(RollupSnapshotter))
    }

    /// Build an update log with a custom snapshot producer.
    #[must_use]
    pub fn with_producer(
        db: Database,
        config: DocLogConfig,
        producer: Arc<dyn SnapshotProducer>,
    ) -> Self {
        Self {
            deltas: DeltaStore::new(db.clone()),
            snapshots: SnapshotStore::new(db),
            counters: VersionCounters::new(),
            producer,
            config,
            snapshot_tasks: Mutex::new(Vec::new()),
        }
    }

    /// The delta store (retention sweeps run against it directly).
    #[must_use]
    pub fn delta_store(&self) -> &DeltaStore {
        &self.deltas
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &DocLogConfig {
        &self.config
    }

    /// Append one delta, assigning the next version for `doc`.
    ///
    /// Runs under the document's counter mutex: the counter is lazily
    /// seeded from storage on first touch, and only advanced once the
    /// record has been persisted; a failed persist leaves it untouched,
    /// so the next append reuses the version and the sequence stays
    /// dense.
    ///
    /// Every `snapshot_interval`-th version schedules an asynchronous
    /// snapshot roll-up; snapshot failures never affect the append.
    ///
    /// # Errors
    ///
    /// [`DocLogError::EmptyDelta`] / [`DocLogError::DeltaTooLarge`] before
    /// any version is reserved; [`DocLogError::Storage`] if persistence
    /// fails (the version is rolled back).
    pub async fn append(
        &self,
        doc: &DocumentKey,
        payload: Vec<u8>,
        principal: PrincipalId,
        client: ClientId,
    ) -> DocLogResult<u64> {
        if payload.is_empty() {
            return Err(DocLogError::EmptyDelta);
        }
        if payload.len() > self.config.max_delta_bytes {
            return Err(DocLogError::DeltaTooLarge {
                size: payload.len(),
                max: self.config.max_delta_bytes,
            });
        }

        let cell = self.counters.cell(doc);
        let mut guard = cell.lock().await;

        let current = match *guard {
            Some(v) => v,
            None => {
                let v = self.deltas.latest_version(doc).await?;
                *guard = Some(v);
                v
            },
        };
        let next = current.saturating_add(1);

        let record = DeltaRecord {
            doc: doc.clone(),
            version: next,
            payload,
            principal,
            client,
            created_at: Utc::now(),
        };
        self.deltas.insert(record).await?;
        *guard = Some(next);
        drop(guard);

        debug!(doc = %doc, version = next, "delta appended");

        if self.config.snapshot_interval > 0 && next % self.config.snapshot_interval == 0 {
            self.schedule_snapshot(doc.clone(), next).await;
        }
        Ok(next)
    }

    /// Current maximum version for `doc` (0 if none).
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn latest_version(&self, doc: &DocumentKey) -> DocLogResult<u64> {
        Ok(self.deltas.latest_version(doc).await?)
    }

    /// Deltas with version greater than `since`, ascending, capped.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn updates_since(
        &self,
        doc: &DocumentKey,
        since: u64,
        limit: usize,
    ) -> DocLogResult<Vec<DeltaRecord>> {
        Ok(self.deltas.updates_since(doc, since, limit).await?)
    }

    /// All deltas for `doc`, ascending. May be large.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn all_updates(&self, doc: &DocumentKey) -> DocLogResult<Vec<DeltaRecord>> {
        Ok(self.deltas.all_updates(doc).await?)
    }

    /// Number of persisted deltas for `doc`.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn count(&self, doc: &DocumentKey) -> DocLogResult<u64> {
        Ok(self.deltas.count(doc).await?)
    }

    /// Persist an externally-produced snapshot.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn snapshot_put(&self, record: SnapshotRecord) -> DocLogResult<()> {
        self.snapshots.put(record).await?;
        Ok(())
    }

    /// The latest snapshot for `doc`, if any.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn snapshot_latest(&self, doc: &DocumentKey) -> DocLogResult<Option<SnapshotRecord>> {
        Ok(self.snapshots.latest(doc).await?)
    }

    /// Versions of all retained snapshots for `doc`, ascending.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn snapshot_versions(&self, doc: &DocumentKey) -> DocLogResult<Vec<u64>> {
        Ok(self.snapshots.versions(doc).await?)
    }

    /// Delete deltas created before `cutoff`; returns rows removed.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn delete_older_than(&self, cutoff: chrono::DateTime<Utc>) -> DocLogResult<u64> {
        Ok(self.deltas.delete_older_than(cutoff).await?)
    }

    /// Tear down everything stored for `doc`.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn delete_document(&self, doc: &DocumentKey) -> DocLogResult<()> {
        self.deltas.delete_document(doc).await?;
        self.snapshots.delete_document(doc).await?;
        self.counters.forget(doc);
        Ok(())
    }

    /// Wait for all currently-scheduled snapshot tasks to finish.
    ///
    /// Used by tests and by shutdown; appends issued after this call may
    /// schedule new tasks.
    pub async fn flush_snapshots(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.snapshot_tasks.lock().await;
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Spawn a background roll-up of `doc` at `version`.
    async fn schedule_snapshot(&self, doc: DocumentKey, version: u64) {
        let deltas = self.deltas.clone();
        let snapshots = self.snapshots.clone();
        let producer = Arc::clone(&self.producer);
        let keep = self.config.snapshot_keep;

        let handle = tokio::spawn(async move {
            if let Err(e) = produce_snapshot(&deltas, &snapshots, &*producer, &doc, version, keep).await
            {
                warn!(doc = %doc, version, error = %e, "snapshot production failed");
            }
        });

        let mut tasks = self.snapshot_tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Counter cell peek for tests.
    #[cfg(test)]
    pub(crate) async fn counter_value(&self, doc: &DocumentKey) -> Option<u64> {
        *self.counters.cell(doc).lock().await
    }
}

impl std::fmt::Debug for UpdateLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateLog")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Read the delta prefix up to `version`, produce bytes, store, prune.
async fn produce_snapshot(
    deltas: &DeltaStore,
    snapshots: &SnapshotStore,
    producer: &dyn SnapshotProducer,
    doc: &DocumentKey,
    version: u64,
    keep: usize,
) -> DocLogResult<()> {
    let mut prefix = deltas.all_updates(doc).await?;
    prefix.retain(|d| d.version <= version);

    let update_count = prefix.len() as u64;
    let (snapshot, state_vector) = producer.produce(&prefix);

    snapshots
        .put(SnapshotRecord {
            doc: doc.clone(),
            version,
            snapshot,
            state_vector,
            update_count,
            created_at: Utc::now(),
        })
        .await?;
    snapshots.prune_keep_latest(doc, keep).await?;

    debug!(doc = %doc, version, update_count, "snapshot produced");
    Ok(())
}
