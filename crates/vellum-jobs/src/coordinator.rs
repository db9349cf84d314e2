//! Queue → worker dispatch, the job status machine, and shutdown.
//!
//! The coordinator is the exclusive owner of job status transitions. N
//! worker loops each claim a message, consult the cache, either
//! short-circuit or run the sandboxed executor, persist the result, and
//! ack. A loop that fails before acking simply leaves the message for
//! redelivery: at-least-once, with duplicate work masked by the cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vellum_core::{DocumentKey, JobId, PrincipalId};
use vellum_storage::{Database, JobRecord, JobStatus, JobStore, QueueMessage};
use vellum_worker::{CompileExecutor, CompileInput, CompileStatus, FileContent, SandboxExecutor};

use crate::artifacts::{input_key, input_prefix, log_key, result_key, ArtifactStore};
use crate::cache::CacheIndex;
use crate::error::{JobError, JobResult};
use crate::events::JobEvent;
use crate::queue::JobQueue;

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Concurrent worker loops.
    pub max_workers: usize,
    /// Active (queued or running) jobs allowed per principal.
    pub per_principal_active_jobs: usize,
    /// How long one claim blocks before re-checking for shutdown.
    pub claim_block: Duration,
    /// Grace given to in-flight jobs on shutdown before their sandboxes
    /// are cancelled.
    pub shutdown_grace: Duration,
    /// Whether completed builds are served from the cache.
    pub cache_enabled: bool,
    /// Cache entry freshness bound; `None` means no bound.
    pub cache_ttl: Option<Duration>,
    /// Unacked claims become reclaimable after this long.
    pub visibility_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            per_principal_active_jobs: 5,
            claim_block: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(20),
            cache_enabled: true,
            cache_ttl: Some(Duration::from_secs(3600)),
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// The job system's front door and worker pool.
pub struct JobCoordinator {
    inner: Arc<Inner>,
    workers: Mutex<JoinSet<()>>,
}

struct Inner {
    jobs: JobStore,
    queue: JobQueue,
    cache: CacheIndex,
    artifacts: Arc<dyn ArtifactStore>,
    executor: Arc<dyn CompileExecutor>,
    events: broadcast::Sender<JobEvent>,
    config: CoordinatorConfig,
    cancel: CancellationToken,
}

impl JobCoordinator {
    /// Build a coordinator over the shared database.
    #[must_use]
    pub fn new(
        db: Database,
        executor: Arc<dyn CompileExecutor>,
        artifacts: Arc<dyn ArtifactStore>,
        config: CoordinatorConfig,
    ) -> Self {
        let jobs = JobStore::new(db.clone());
        let queue = JobQueue::new(db, config.visibility_timeout);
        let cache = CacheIndex::new(jobs.clone(), config.cache_enabled, config.cache_ttl);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                jobs,
                queue,
                cache,
                artifacts,
                executor,
                events,
                config,
                cancel: CancellationToken::new(),
            }),
            workers: Mutex::new(JoinSet::new()),
        }
    }

    /// Subscribe to job lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// The job record store (status queries, project listings).
    #[must_use]
    pub fn job_store(&self) -> &JobStore {
        &self.inner.jobs
    }

    /// The underlying queue (introspection).
    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    /// Admit and enqueue one job.
    ///
    /// Input files are persisted to the object store first, so any
    /// worker, including one on another replica or a later boot, can
    /// materialize the build.
    ///
    /// # Errors
    ///
    /// [`JobError::AdmissionLimitExceeded`] if the principal is at its
    /// active-job cap (nothing is enqueued); otherwise storage or
    /// artifact errors.
    pub async fn submit(
        &self,
        doc: DocumentKey,
        principal: PrincipalId,
        input: &CompileInput,
        priority: i64,
    ) -> JobResult<JobRecord> {
        let inner = &self.inner;
        let active = inner.jobs.count_active_for(&principal).await?;
        if active >= inner.config.per_principal_active_jobs {
            return Err(JobError::AdmissionLimitExceeded {
                principal,
                limit: inner.config.per_principal_active_jobs,
            });
        }

        for (path, content) in &input.files {
            inner
                .artifacts
                .put(&input_key(&doc.project, path), content.as_bytes())
                .await?;
        }

        let record = JobRecord::new(
            doc,
            principal,
            input.engine.as_str(),
            input.entry.as_str(),
            input.fingerprint(),
            priority,
        );
        inner.jobs.insert(record.clone()).await?;
        inner.queue.enqueue(record.id).await?;

        info!(job = %record.id, doc = %record.doc, engine = %record.engine, "job submitted");
        Ok(record)
    }

    /// Cancel a queued job. Running and terminal jobs are refused; a
    /// worker that later claims the cancelled message acks and skips it.
    ///
    /// # Errors
    ///
    /// [`JobError::UnknownJob`] or [`JobError::InvalidTransition`].
    pub async fn cancel(&self, job_id: JobId) -> JobResult<JobRecord> {
        let inner = &self.inner;
        let mut job = inner
            .jobs
            .get(job_id)
            .await?
            .ok_or(JobError::UnknownJob(job_id))?;

        transition(&mut job, JobStatus::Cancelled)?;
        job.completed_at = Some(Utc::now());
        inner.jobs.update(job.clone()).await?;
        inner.emit(JobEvent::Finished { job: job.clone() });
        info!(job = %job.id, "job cancelled");
        Ok(job)
    }

    /// Start the worker pool.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        for i in 0..self.inner.config.max_workers {
            let inner = Arc::clone(&self.inner);
            let consumer = format!("worker-{i}");
            workers.spawn(worker_loop(inner, consumer));
        }
        info!(workers = self.inner.config.max_workers, "worker pool started");
    }

    /// Stop claiming, drain in-flight jobs within the grace period, then
    /// abort stragglers (their sandboxes die with them and the unacked
    /// messages are redelivered on next boot).
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let grace = self.inner.config.shutdown_grace;
        let mut workers = self.workers.lock().await;

        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("shutdown grace expired; cancelling in-flight sandboxes");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        info!("worker pool stopped");
    }
}

/// One worker loop: claim, process, repeat until shutdown.
async fn worker_loop(inner: Arc<Inner>, consumer: String) {
    debug!(consumer, "worker loop started");
    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            claimed = inner.queue.claim(&consumer, inner.config.claim_block) => {
                match claimed {
                    Ok(Some(message)) => {
                        if let Err(e) = inner.process(message).await {
                            // No ack on failure: the visibility timeout
                            // redelivers the message.
                            warn!(consumer, error = %e, "job processing failed, leaving for redelivery");
                        }
                    },
                    Ok(None) => {},
                    Err(e) => {
                        warn!(consumer, error = %e, "claim failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    },
                }
            }
        }
    }
    debug!(consumer, "worker loop stopped");
}

impl Inner {
    fn emit(&self, event: JobEvent) {
        // A send error just means nobody is listening right now.
        let _ = self.events.send(event);
    }

    /// Drive one claimed message to ack (or leave it for redelivery by
    /// returning an error).
    async fn process(&self, message: QueueMessage) -> JobResult<()> {
        let Some(mut job) = self.jobs.get(message.job_id).await? else {
            // Orphaned message; the record is gone.
            self.queue.ack(message.message_id).await?;
            return Ok(());
        };

        if job.status.is_terminal() {
            // Cancelled while queued, or redelivered after completion.
            debug!(job = %job.id, status = %job.status, "skipping terminal job");
            self.queue.ack(message.message_id).await?;
            return Ok(());
        }

        // Cache look-aside: an identical completed build short-circuits
        // the sandbox entirely.
        if let Some(hit) = self.cache.lookup(&job.fingerprint).await? {
            if hit.id != job.id {
                return self.complete_from_cache(job, &hit, message.message_id).await;
            }
        }

        self.mark_running(&mut job).await?;

        let input = self.load_input(&job).await?;
        let outcome = self.executor.execute(&input).await?;

        let now = Utc::now();
        job.completed_at = Some(now);
        job.duration_ms = Some(outcome.duration_ms);

        // The log is kept for every terminal state, timeout included.
        if !outcome.log.is_empty() {
            let key = log_key(job.id);
            self.artifacts.put(&key, outcome.log.as_bytes()).await?;
            job.log_key = Some(key);
        }

        match outcome.status {
            CompileStatus::Completed => {
                if let Some(artifact) = &outcome.artifact {
                    let key = result_key(job.id, &SandboxExecutor::artifact_name(&job.entry));
                    self.artifacts.put(&key, artifact).await?;
                    job.result_key = Some(key);
                }
                transition(&mut job, JobStatus::Completed)?;
            },
            CompileStatus::Failed => {
                job.error = outcome.error;
                transition(&mut job, JobStatus::Failed)?;
            },
            CompileStatus::Timeout => {
                job.error = outcome.error;
                transition(&mut job, JobStatus::Timeout)?;
            },
        }

        self.jobs.update(job.clone()).await?;
        self.emit(JobEvent::Finished { job });
        self.queue.ack(message.message_id).await?;
        Ok(())
    }

    /// Serve a job from a prior completed build with the same
    /// fingerprint: same artifact keys, no sandbox launch.
    async fn complete_from_cache(
        &self,
        mut job: JobRecord,
        hit: &JobRecord,
        message_id: i64,
    ) -> JobResult<()> {
        self.mark_running(&mut job).await?;

        job.completed_at = Some(Utc::now());
        job.duration_ms = Some(0);
        job.result_key = hit.result_key.clone();
        job.log_key = hit.log_key.clone();
        job.cached = true;
        transition(&mut job, JobStatus::Completed)?;

        self.jobs.update(job.clone()).await?;
        info!(job = %job.id, source = %hit.id, "job served from cache");
        self.emit(JobEvent::Finished { job });
        self.queue.ack(message_id).await?;
        Ok(())
    }

    /// Transition to running and announce it. A job redelivered while
    /// already `running` (its first worker died mid-build) is picked up
    /// as-is.
    async fn mark_running(&self, job: &mut JobRecord) -> JobResult<()> {
        if job.status == JobStatus::Running {
            debug!(job = %job.id, "resuming job left running by a dead worker");
            return Ok(());
        }
        transition(job, JobStatus::Running)?;
        job.started_at = Some(Utc::now());
        self.jobs.update(job.clone()).await?;
        self.emit(JobEvent::Started { job: job.clone() });
        Ok(())
    }

    /// Rebuild the compile input from the project's stored file tree.
    async fn load_input(&self, job: &JobRecord) -> JobResult<CompileInput> {
        let prefix = input_prefix(&job.doc.project);
        let mut input = CompileInput::new(&job.engine, &job.entry)?;
        for key in self.artifacts.list(&prefix).await? {
            let Some(rel) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(bytes) = self.artifacts.get(&key).await? {
                input.add_file(rel, FileContent::Binary(bytes))?;
            }
        }
        Ok(input)
    }
}

/// Enforce the status DAG in one place.
fn transition(job: &mut JobRecord, to: JobStatus) -> JobResult<()> {
    if !job.status.can_transition(to) {
        return Err(JobError::InvalidTransition {
            job: job.id,
            from: job.status,
            to,
        });
    }
    job.status = to;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vellum_storage::QueueStore;
    use vellum_worker::{CompileOutcome, WorkerResult};

    /// What the fake executor should do per invocation.
    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        TimeOut,
    }

    /// Counts invocations so tests can assert the sandbox never launched.
    struct RecordingExecutor {
        behavior: Behavior,
        invocations: AtomicUsize,
    }

    impl RecordingExecutor {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                invocations: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CompileExecutor for RecordingExecutor {
        async fn execute(&self, _input: &CompileInput) -> WorkerResult<CompileOutcome> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(match self.behavior {
                Behavior::Succeed => CompileOutcome {
                    status: CompileStatus::Completed,
                    artifact: Some(b"pdf-bytes".to_vec()),
                    log: "This is a build log\n".to_owned(),
                    error: None,
                    duration_ms: 42,
                },
                Behavior::Fail => CompileOutcome {
                    status: CompileStatus::Failed,
                    artifact: None,
                    log: "! Undefined control sequence.\n".to_owned(),
                    error: Some("! Undefined control sequence.".to_owned()),
                    duration_ms: 10,
                },
                Behavior::TimeOut => CompileOutcome {
                    status: CompileStatus::Timeout,
                    artifact: None,
                    log: "partial output before the kill\n".to_owned(),
                    error: Some("build timed out".to_owned()),
                    duration_ms: 30_500,
                },
            })
        }
    }

    fn doc() -> DocumentKey {
        DocumentKey::new("proj", "main.tex").unwrap()
    }

    fn compile_input() -> CompileInput {
        let mut input = CompileInput::new("pdflatex", "main.tex").unwrap();
        input
            .add_file("main.tex", FileContent::Text("A\n".into()))
            .unwrap();
        input
    }

    struct Harness {
        coordinator: JobCoordinator,
        executor: Arc<RecordingExecutor>,
        db: Database,
        _artifacts_dir: tempfile::TempDir,
    }

    async fn harness(behavior: Behavior, config: CoordinatorConfig) -> Harness {
        let db = Database::open_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::new(behavior);
        let coordinator = JobCoordinator::new(
            db.clone(),
            executor.clone(),
            Arc::new(FsArtifactStore::new(dir.path())),
            config,
        );
        Harness {
            coordinator,
            executor,
            db,
            _artifacts_dir: dir,
        }
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            max_workers: 2,
            claim_block: Duration::from_millis(50),
            visibility_timeout: Duration::from_millis(200),
            ..CoordinatorConfig::default()
        }
    }

    /// Wait for the `Finished` event of one job and return the record.
    async fn wait_finished(
        events: &mut broadcast::Receiver<JobEvent>,
        id: JobId,
    ) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let JobEvent::Finished { job } = events.recv().await.unwrap() {
                    if job.id == id {
                        return job;
                    }
                }
            }
        })
        .await
        .expect("job did not finish in time")
    }

    #[tokio::test]
    async fn successful_job_runs_to_completion() {
        let h = harness(Behavior::Succeed, fast_config()).await;
        let mut events = h.coordinator.subscribe();
        h.coordinator.start().await;

        let job = h
            .coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await
            .unwrap();

        let finished = wait_finished(&mut events, job.id).await;
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.duration_ms, Some(42));
        assert!(finished.started_at.is_some());
        assert!(!finished.cached);
        assert_eq!(
            finished.result_key.as_deref(),
            Some(format!("compilations/{}/main.pdf", job.id).as_str())
        );
        assert!(finished.log_key.is_some());

        // The queue drained.
        assert!(h.coordinator.queue().is_empty().await.unwrap());
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn admission_limit_refuses_without_enqueue() {
        let config = CoordinatorConfig {
            per_principal_active_jobs: 1,
            ..fast_config()
        };
        // No workers started: the first job stays queued.
        let h = harness(Behavior::Succeed, config).await;

        h.coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await
            .unwrap();

        let refused = h
            .coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await;
        assert!(matches!(
            refused,
            Err(JobError::AdmissionLimitExceeded { limit: 1, .. })
        ));
        // Nothing extra was enqueued.
        assert_eq!(h.coordinator.queue().len().await.unwrap(), 1);

        // Another principal is unaffected.
        h.coordinator
            .submit(doc(), PrincipalId::new("u2"), &compile_input(), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn identical_inputs_short_circuit_through_the_cache() {
        let h = harness(Behavior::Succeed, fast_config()).await;
        let mut events = h.coordinator.subscribe();
        h.coordinator.start().await;

        let first = h
            .coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await
            .unwrap();
        let first_done = wait_finished(&mut events, first.id).await;
        assert_eq!(h.executor.count(), 1);

        let second = h
            .coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await
            .unwrap();
        assert_eq!(second.fingerprint, first.fingerprint);

        let second_done = wait_finished(&mut events, second.id).await;
        assert_eq!(second_done.status, JobStatus::Completed);
        assert!(second_done.cached);
        // Same artifact keys as the prior build; sandbox never launched.
        assert_eq!(second_done.result_key, first_done.result_key);
        assert_eq!(second_done.log_key, first_done.log_key);
        assert_eq!(h.executor.count(), 1);

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn failed_build_surfaces_extracted_error() {
        let h = harness(Behavior::Fail, fast_config()).await;
        let mut events = h.coordinator.subscribe();
        h.coordinator.start().await;

        let job = h
            .coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await
            .unwrap();

        let finished = wait_finished(&mut events, job.id).await;
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(
            finished.error.as_deref(),
            Some("! Undefined control sequence.")
        );
        assert!(finished.result_key.is_none());
        assert!(finished.log_key.is_some());

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn timed_out_build_keeps_log_but_no_artifact() {
        let h = harness(Behavior::TimeOut, fast_config()).await;
        let mut events = h.coordinator.subscribe();
        h.coordinator.start().await;

        let job = h
            .coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await
            .unwrap();

        let finished = wait_finished(&mut events, job.id).await;
        assert_eq!(finished.status, JobStatus::Timeout);
        assert!(finished.duration_ms.unwrap() >= 30_000);
        assert!(finished.result_key.is_none());
        assert!(finished.log_key.is_some());

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn dead_consumer_claim_is_redelivered_and_completed() {
        let h = harness(Behavior::Succeed, fast_config()).await;
        let mut events = h.coordinator.subscribe();

        let job = h
            .coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await
            .unwrap();

        // A consumer claims the message and dies without acking.
        let raw = QueueStore::new(h.db.clone());
        let stolen = raw
            .claim("dead-worker", chrono::Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stolen.job_id, job.id);

        // Workers start afterwards; once the visibility timeout lapses
        // the message is claimable again and a successor completes it.
        h.coordinator.start().await;
        let finished = wait_finished(&mut events, job.id).await;
        assert_eq!(finished.status, JobStatus::Completed);

        // Exactly one terminal record for the job id.
        let fetched = h.coordinator.job_store().get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);

        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_queued_job_is_skipped_by_workers() {
        let h = harness(Behavior::Succeed, fast_config()).await;

        let job = h
            .coordinator
            .submit(doc(), PrincipalId::new("u1"), &compile_input(), 0)
            .await
            .unwrap();
        let cancelled = h.coordinator.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // Workers drain the message without executing anything.
        h.coordinator.start().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.coordinator.queue().is_empty().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.executor.count(), 0);
        let fetched = h.coordinator.job_store().get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Cancelled);

        // Cancelling again (or cancelling a terminal job) is refused.
        assert!(matches!(
            h.coordinator.cancel(job.id).await,
            Err(JobError::InvalidTransition { .. })
        ));

        h.coordinator.shutdown().await;
    }
}
