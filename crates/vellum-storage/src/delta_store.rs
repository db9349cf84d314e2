//! Persistent delta log: `(document, version)`-keyed opaque updates.

use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, Row};
use tracing::debug;
use vellum_core::{ClientId, DocumentKey, PrincipalId};

use crate::db::Database;
use crate::error::{StorageError, StorageResult};
use crate::records::{version_from_db, version_to_db, DeltaRecord};

/// Store for [`DeltaRecord`]s.
#[derive(Debug, Clone)]
pub struct DeltaStore {
    db: Database,
}

impl DeltaStore {
    /// Create a store over the shared database handle.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist one delta.
    ///
    /// # Errors
    ///
    /// [`StorageError::DuplicateVersion`] if `(doc, version)` already
    /// exists; otherwise any underlying query error.
    pub async fn insert(&self, record: DeltaRecord) -> StorageResult<()> {
        self.db
            .call(move |conn| {
                let byte_size = i64::try_from(record.payload.len())
                    .map_err(|_| StorageError::Corrupt("payload too large".to_owned()))?;
                let result = conn.execute(
                    "INSERT INTO deltas (doc_key, version, payload, principal, client_id, created_at, byte_size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.doc.to_string(),
                        version_to_db(record.version),
                        record.payload,
                        record.principal.as_str(),
                        record.client.as_str(),
                        record.created_at,
                        byte_size,
                    ],
                );
                match result {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        Err(StorageError::DuplicateVersion {
                            doc: record.doc.clone(),
                            version: record.version,
                        })
                    },
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Highest persisted version for `doc`, or 0 if none.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn latest_version(&self, doc: &DocumentKey) -> StorageResult<u64> {
        let key = doc.to_string();
        self.db
            .call(move |conn| {
                let max: Option<i64> = conn.query_row(
                    "SELECT MAX(version) FROM deltas WHERE doc_key = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                Ok(max.map_or(0, version_from_db))
            })
            .await
    }

    /// Deltas with version strictly greater than `since`, ascending,
    /// capped at `limit`.
    ///
    /// # Errors
    ///
    /// Any underlying query error, or [`StorageError::Corrupt`] for an
    /// unparsable stored key.
    pub async fn updates_since(
        &self,
        doc: &DocumentKey,
        since: u64,
        limit: usize,
    ) -> StorageResult<Vec<DeltaRecord>> {
        let key = doc.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT doc_key, version, payload, principal, client_id, created_at
                     FROM deltas WHERE doc_key = ?1 AND version > ?2
                     ORDER BY version ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![key, version_to_db(since), limit], row_to_delta)?;
                collect_deltas(rows)
            })
            .await
    }

    /// All deltas for `doc`, ascending by version. May be large.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn all_updates(&self, doc: &DocumentKey) -> StorageResult<Vec<DeltaRecord>> {
        let key = doc.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT doc_key, version, payload, principal, client_id, created_at
                     FROM deltas WHERE doc_key = ?1 ORDER BY version ASC",
                )?;
                let rows = stmt.query_map(params![key], row_to_delta)?;
                collect_deltas(rows)
            })
            .await
    }

    /// Number of persisted deltas for `doc`.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn count(&self, doc: &DocumentKey) -> StorageResult<u64> {
        let key = doc.to_string();
        self.db
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM deltas WHERE doc_key = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                Ok(version_from_db(n))
            })
            .await
    }

    /// Delete deltas created before `cutoff`, across all documents.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        self.db
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM deltas WHERE created_at < ?1",
                    params![cutoff],
                )?;
                if removed > 0 {
                    debug!(removed, "delta retention sweep removed rows");
                }
                Ok(removed as u64)
            })
            .await
    }

    /// Remove every delta for `doc` (document teardown).
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn delete_document(&self, doc: &DocumentKey) -> StorageResult<u64> {
        let key = doc.to_string();
        self.db
            .call(move |conn| {
                let removed =
                    conn.execute("DELETE FROM deltas WHERE doc_key = ?1", params![key])?;
                Ok(removed as u64)
            })
            .await
    }

}

fn row_to_delta(row: &Row<'_>) -> rusqlite::Result<(String, i64, Vec<u8>, String, String, DateTime<Utc>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn collect_deltas(
    rows: impl Iterator<Item = rusqlite::Result<(String, i64, Vec<u8>, String, String, DateTime<Utc>)>>,
) -> StorageResult<Vec<DeltaRecord>> {
    let mut records = Vec::new();
    for row in rows {
        let (key, version, payload, principal, client, created_at) = row?;
        let doc: DocumentKey = key
            .parse()
            .map_err(|_| StorageError::Corrupt(format!("bad document key: {key}")))?;
        records.push(DeltaRecord {
            doc,
            version: version_from_db(version),
            payload,
            principal: PrincipalId::new(principal),
            client: ClientId::new(client),
            created_at,
        });
    }
    Ok(records)
}
