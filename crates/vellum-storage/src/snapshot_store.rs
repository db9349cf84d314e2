//! Persistent snapshot roll-ups, keyed by `(document, version)`.

use rusqlite::{params, OptionalExtension as _};
use tracing::debug;
use vellum_core::DocumentKey;

use crate::db::Database;
use crate::error::{StorageError, StorageResult};
use crate::records::{version_from_db, version_to_db, SnapshotRecord};

/// Store for [`SnapshotRecord`]s.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    db: Database,
}

impl SnapshotStore {
    /// Create a store over the shared database handle.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist one snapshot. Re-writing the same `(doc, version)` replaces
    /// the previous bytes (snapshot production is idempotent per version).
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn put(&self, record: SnapshotRecord) -> StorageResult<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO snapshots
                     (doc_key, version, snapshot, state_vector, update_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.doc.to_string(),
                        version_to_db(record.version),
                        record.snapshot,
                        record.state_vector,
                        version_to_db(record.update_count),
                        record.created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// The highest-versioned snapshot for `doc`, if any.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn latest(&self, doc: &DocumentKey) -> StorageResult<Option<SnapshotRecord>> {
        let key = doc.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT doc_key, version, snapshot, state_vector, update_count, created_at
                     FROM snapshots WHERE doc_key = ?1 ORDER BY version DESC LIMIT 1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()?
                .map(|(key, version, snapshot, state_vector, update_count, created_at)| {
                    let doc: DocumentKey = key
                        .parse()
                        .map_err(|_| StorageError::Corrupt(format!("bad document key: {key}")))?;
                    Ok(SnapshotRecord {
                        doc,
                        version: version_from_db(version),
                        snapshot,
                        state_vector,
                        update_count: version_from_db(update_count),
                        created_at,
                    })
                })
                .transpose()
            })
            .await
    }

    /// Versions of all snapshots for `doc`, ascending (diagnostics and
    /// retention).
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn versions(&self, doc: &DocumentKey) -> StorageResult<Vec<u64>> {
        let key = doc.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT version FROM snapshots WHERE doc_key = ?1 ORDER BY version ASC",
                )?;
                let versions = stmt
                    .query_map(params![key], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<i64>, _>>()?;
                Ok(versions.into_iter().map(version_from_db).collect())
            })
            .await
    }

    /// Keep only the latest `keep` snapshots for `doc`; returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn prune_keep_latest(&self, doc: &DocumentKey, keep: usize) -> StorageResult<u64> {
        let key = doc.to_string();
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM snapshots WHERE doc_key = ?1 AND version NOT IN (
                         SELECT version FROM snapshots WHERE doc_key = ?1
                         ORDER BY version DESC LIMIT ?2
                     )",
                    params![key, keep],
                )?;
                if removed > 0 {
                    debug!(doc = %key, removed, "pruned old snapshots");
                }
                Ok(removed as u64)
            })
            .await
    }

    /// Remove every snapshot for `doc` (document teardown).
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn delete_document(&self, doc: &DocumentKey) -> StorageResult<u64> {
        let key = doc.to_string();
        self.db
            .call(move |conn| {
                let removed =
                    conn.execute("DELETE FROM snapshots WHERE doc_key = ?1", params![key])?;
                Ok(removed as u64)
            })
            .await
    }
}
