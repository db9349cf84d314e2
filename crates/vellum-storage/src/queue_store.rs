//! Durable queue message table with consumer-group claim semantics.
//!
//! A message is a pointer to a job. Claiming stamps `(claimed_by,
//! claimed_at)`; acking deletes the row. A claim whose consumer never
//! acks becomes reclaimable once the visibility timeout passes; that is
//! the whole at-least-once story, and it lives in the store so it
//! survives process crashes.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension as _};
use tracing::trace;
use vellum_core::JobId;

use crate::db::Database;
use crate::error::{StorageError, StorageResult};

/// A claimed queue message: the id to ack plus the job it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMessage {
    /// Message id, passed back to [`QueueStore::ack`].
    pub message_id: i64,
    /// The job to execute.
    pub job_id: JobId,
}

/// Store for queue messages.
#[derive(Debug, Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    /// Create a store over the shared database handle.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message to the tail; returns its message id.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn push(&self, job_id: JobId) -> StorageResult<i64> {
        let job_id = job_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO queue (job_id, enqueued_at) VALUES (?1, ?2)",
                    params![job_id, Utc::now()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Claim the oldest available message for `consumer`, if any.
    ///
    /// Available means never claimed, or claimed longer ago than
    /// `visibility` without an ack. The claim is stamped atomically inside
    /// a transaction, so two consumers cannot claim the same message.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn claim(
        &self,
        consumer: &str,
        visibility: Duration,
    ) -> StorageResult<Option<QueueMessage>> {
        let consumer = consumer.to_owned();
        self.db
            .call(move |conn| {
                let expired: DateTime<Utc> = Utc::now() - visibility;
                let tx = conn.transaction()?;

                let candidate: Option<(i64, String)> = tx
                    .query_row(
                        "SELECT id, job_id FROM queue
                         WHERE claimed_at IS NULL OR claimed_at < ?1
                         ORDER BY id ASC LIMIT 1",
                        params![expired],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let Some((message_id, job_id)) = candidate else {
                    return Ok(None);
                };

                tx.execute(
                    "UPDATE queue SET claimed_by = ?2, claimed_at = ?3 WHERE id = ?1",
                    params![message_id, consumer, Utc::now()],
                )?;
                tx.commit()?;

                let job_id = JobId::parse(&job_id)
                    .map_err(|_| StorageError::Corrupt(format!("bad job id in queue: {job_id}")))?;
                trace!(message_id, %job_id, consumer, "queue message claimed");
                Ok(Some(QueueMessage { message_id, job_id }))
            })
            .await
    }

    /// Acknowledge (and remove) a claimed message.
    ///
    /// Acking an already-removed message is a no-op: redelivered work may
    /// legitimately be acked by two consumers.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn ack(&self, message_id: i64) -> StorageResult<()> {
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM queue WHERE id = ?1", params![message_id])?;
                Ok(())
            })
            .await
    }

    /// Number of claimed-but-unacked messages, optionally for one consumer.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn pending(&self, consumer: Option<&str>) -> StorageResult<u64> {
        let consumer = consumer.map(ToOwned::to_owned);
        self.db
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM queue
                     WHERE claimed_by IS NOT NULL AND (?1 IS NULL OR claimed_by = ?1)",
                    params![consumer],
                    |row| row.get(0),
                )?;
                Ok(u64::try_from(n).unwrap_or(0))
            })
            .await
    }

    /// Total messages in the stream (claimed or not).
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn len(&self) -> StorageResult<u64> {
        self.db
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
                Ok(u64::try_from(n).unwrap_or(0))
            })
            .await
    }

    /// Whether the stream is empty.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> QueueStore {
        QueueStore::new(Database::open_memory().await.unwrap())
    }

    #[tokio::test]
    async fn push_claim_ack_lifecycle() {
        let store = store().await;
        let job = JobId::new();
        let message_id = store.push(job).await.unwrap();

        let claimed = store
            .claim("w1", Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.message_id, message_id);
        assert_eq!(claimed.job_id, job);
        assert_eq!(store.pending(Some("w1")).await.unwrap(), 1);

        store.ack(message_id).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
        assert_eq!(store.pending(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claims_are_fifo() {
        let store = store().await;
        let first = JobId::new();
        let second = JobId::new();
        store.push(first).await.unwrap();
        store.push(second).await.unwrap();

        let a = store.claim("w1", Duration::seconds(60)).await.unwrap().unwrap();
        let b = store.claim("w1", Duration::seconds(60)).await.unwrap().unwrap();
        assert_eq!(a.job_id, first);
        assert_eq!(b.job_id, second);
    }

    #[tokio::test]
    async fn claimed_message_is_invisible_to_other_consumers() {
        let store = store().await;
        store.push(JobId::new()).await.unwrap();

        assert!(store.claim("w1", Duration::seconds(60)).await.unwrap().is_some());
        assert!(store.claim("w2", Duration::seconds(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_claim_is_redelivered_after_visibility_timeout() {
        let store = store().await;
        let job = JobId::new();
        store.push(job).await.unwrap();

        // w1 claims, then dies without acking.
        let first = store
            .claim("w1", Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();

        // With a zero visibility window the claim is immediately stale.
        let second = store
            .claim("w2", Duration::zero())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.job_id, job);
    }

    #[tokio::test]
    async fn claim_on_empty_queue_is_none() {
        let store = store().await;
        assert!(store.claim("w1", Duration::seconds(60)).await.unwrap().is_none());
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn double_ack_is_harmless() {
        let store = store().await;
        let id = store.push(JobId::new()).await.unwrap();
        store.ack(id).await.unwrap();
        store.ack(id).await.unwrap();
    }
}
