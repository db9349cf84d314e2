//! Blocking claim/ack facade over the durable queue table.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;
use vellum_core::JobId;
use vellum_storage::{Database, QueueMessage, QueueStore};

use crate::error::JobResult;

/// Durable job queue with consumer-group semantics.
///
/// Delivery is at-least-once: a claim that is never acked becomes
/// reclaimable after the visibility timeout. Within one consumer's claim
/// sequence messages arrive FIFO; across consumers there is no order.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: QueueStore,
    notify: Arc<Notify>,
    visibility: chrono::Duration,
}

impl JobQueue {
    /// Create a queue over the shared database.
    #[must_use]
    pub fn new(db: Database, visibility: Duration) -> Self {
        Self {
            store: QueueStore::new(db),
            notify: Arc::new(Notify::new()),
            visibility: chrono::Duration::from_std(visibility)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    /// Append a job to the tail; returns the message id.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn enqueue(&self, job_id: JobId) -> JobResult<i64> {
        let message_id = self.store.push(job_id).await?;
        self.notify.notify_one();
        trace!(%job_id, message_id, "job enqueued");
        Ok(message_id)
    }

    /// Claim the next available message, blocking up to `block_timeout`.
    ///
    /// Returns `None` exactly when the timeout passes with nothing
    /// claimable.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn claim(
        &self,
        consumer: &str,
        block_timeout: Duration,
    ) -> JobResult<Option<QueueMessage>> {
        let deadline = Instant::now() + block_timeout;
        loop {
            // Register interest before probing, so an enqueue landing
            // between the probe and the wait still wakes us.
            let notified = self.notify.notified();

            if let Some(message) = self.store.claim(consumer, self.visibility).await? {
                return Ok(Some(message));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Acknowledge (remove) a delivered message.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn ack(&self, message_id: i64) -> JobResult<()> {
        self.store.ack(message_id).await?;
        Ok(())
    }

    /// Claimed-but-unacked message count, optionally for one consumer.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn pending(&self, consumer: Option<&str>) -> JobResult<u64> {
        Ok(self.store.pending(consumer).await?)
    }

    /// Total messages in the stream.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn len(&self) -> JobResult<u64> {
        Ok(self.store.len().await?)
    }

    /// Whether the stream is empty.
    ///
    /// # Errors
    ///
    /// Any underlying storage error.
    pub async fn is_empty(&self) -> JobResult<bool> {
        Ok(self.len().await? == 0)
    }
}
