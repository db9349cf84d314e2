//! Bridge from job lifecycle events to room frames.
//!
//! The coordinator announces transitions on its broadcast channel; this
//! duty maps each one to a `compilation_*` frame and fans it out to the
//! job's document room (all sessions; the submitter wants it too).

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vellum_core::{CompilationEventPayload, DocumentKey, Frame, FrameKind};
use vellum_hub::HubHandle;
use vellum_jobs::JobEvent;
use vellum_storage::JobStatus;

/// Run the bridge until shutdown or the coordinator closes its channel.
pub async fn run_job_events(
    hub: HubHandle,
    mut events: broadcast::Receiver<JobEvent>,
    cancel: CancellationToken,
) {
    info!("job event bridge started");
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    let (doc, frame) = frame_for(&event);
                    let _ = hub.broadcast(doc, frame, None).await;
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "job event bridge lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    info!("job event bridge stopped");
}

/// Map one lifecycle event onto its wire frame.
fn frame_for(event: &JobEvent) -> (DocumentKey, Frame) {
    let job = event.job();
    let kind = match event {
        JobEvent::Started { .. } => FrameKind::CompilationStarted,
        JobEvent::Finished { job } => match job.status {
            JobStatus::Completed => FrameKind::CompilationCompleted,
            _ => FrameKind::CompilationFailed,
        },
    };
    let payload = CompilationEventPayload {
        job_id: job.id,
        status: job.status.as_str().to_owned(),
        result_key: job.result_key.clone(),
        log_key: job.log_key.clone(),
        error: job.error.clone(),
        cached: job.cached,
        duration_ms: job.duration_ms,
    };
    (job.doc.clone(), Frame::compilation(kind, &payload))
}
