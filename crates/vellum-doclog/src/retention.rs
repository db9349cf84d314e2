//! Background retention sweep for aged-out deltas.
//!
//! Snapshot retention (keep latest K) is enforced at snapshot-write time;
//! this task only reclaims deltas older than the configured window.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::log::UpdateLog;

/// Run the delta retention sweep until `cancel` fires.
///
/// Every `interval`, deltas created more than `retention_days` ago are
/// deleted. Sweep failures are logged and retried on the next tick.
pub async fn run_retention(
    log: Arc<UpdateLog>,
    retention_days: i64,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(retention_days, "retention sweep started");
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("retention sweep shutting down");
                return;
            }
            () = tokio::time::sleep(interval) => {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
                match log.delete_older_than(cutoff).await {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "retention sweep reclaimed deltas");
                    },
                    Ok(_) => {},
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::DocLogConfig;
    use chrono::Utc;
    use vellum_core::{ClientId, DocumentKey, PrincipalId};
    use vellum_storage::{Database, DeltaRecord};

    #[tokio::test]
    async fn sweep_reclaims_old_deltas_and_stops_on_cancel() {
        let log = Arc::new(UpdateLog::new(
            Database::open_memory().await.unwrap(),
            DocLogConfig::default(),
        ));
        let doc = DocumentKey::new("p", "d").unwrap();

        log.delta_store()
            .insert(DeltaRecord {
                doc: doc.clone(),
                version: 1,
                payload: vec![1],
                principal: PrincipalId::new("u"),
                client: ClientId::new("c"),
                created_at: Utc::now() - chrono::Duration::days(90),
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_retention(
            Arc::clone(&log),
            30,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        // Give the sweep a few ticks to run.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.count(&doc).await.unwrap(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
