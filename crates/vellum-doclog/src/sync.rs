//! State synchronization for connecting clients.
//!
//! A client presents the last version it knows (`since`); the server
//! answers with the cheapest catch-up set: the latest snapshot when the
//! client is behind it, plus the delta tail.

use tracing::debug;
use vellum_core::DocumentKey;
use vellum_storage::{DeltaRecord, SnapshotRecord};

use crate::error::DocLogResult;
use crate::log::UpdateLog;

/// The catch-up set for one client.
#[derive(Debug, Clone)]
pub struct SyncResponse {
    /// Snapshot to apply first, when the client is behind it.
    pub snapshot: Option<SnapshotRecord>,
    /// Deltas to replay after the snapshot (ascending, capped).
    pub updates: Vec<DeltaRecord>,
    /// The document's current maximum version.
    pub latest_version: u64,
}

impl UpdateLog {
    /// Compute the catch-up set for a client that knows versions up to
    /// `since`.
    ///
    /// - `since` below the latest snapshot (including 0): snapshot plus
    ///   deltas after the snapshot's version.
    /// - `since` at or past the latest snapshot, or no snapshot: deltas
    ///   after `since` only.
    ///
    /// The delta tail is capped at `max_updates_per_fetch`; a client that
    /// receives a full page calls again with the new `since`.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn updates_for_client(
        &self,
        doc: &DocumentKey,
        since: u64,
    ) -> DocLogResult<SyncResponse> {
        let limit = self.config().max_updates_per_fetch;
        let snapshot = self.snapshot_latest(doc).await?;

        let (snapshot, floor) = match snapshot {
            Some(s) if since < s.version => {
                let floor = s.version;
                (Some(s), floor)
            },
            _ => (None, since),
        };

        let updates = self.updates_since(doc, floor, limit).await?;
        let latest_version = self.latest_version(doc).await?;

        debug!(
            doc = %doc,
            since,
            snapshot = snapshot.as_ref().map(|s| s.version),
            updates = updates.len(),
            "sync response computed"
        );

        Ok(SyncResponse {
            snapshot,
            updates,
            latest_version,
        })
    }
}
