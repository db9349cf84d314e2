//! The executor seam and its outcome types.

use async_trait::async_trait;

use crate::error::WorkerResult;
use crate::input::CompileInput;

/// Terminal result of one sandboxed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStatus {
    /// The engine exited zero and produced an artifact.
    Completed,
    /// The engine exited non-zero or produced no artifact.
    Failed,
    /// The wall-clock deadline expired and the sandbox was terminated.
    Timeout,
}

/// Everything a build run reports back.
///
/// On [`CompileStatus::Timeout`] the artifact is always absent (partial
/// outputs are discarded) but the log is kept for diagnosis.
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    /// Terminal status.
    pub status: CompileStatus,
    /// Produced artifact bytes, for completed builds.
    pub artifact: Option<Vec<u8>>,
    /// Combined engine output (stdout then stderr).
    pub log: String,
    /// Extracted error text, for failed builds.
    pub error: Option<String>,
    /// Elapsed wall-clock milliseconds.
    pub duration_ms: u64,
}

/// Executes one compilation in isolation.
///
/// Production uses [`SandboxExecutor`](crate::SandboxExecutor); the job
/// coordinator is tested against recording fakes of this trait.
#[async_trait]
pub trait CompileExecutor: Send + Sync + 'static {
    /// Run the build to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerError`](crate::WorkerError) only when no outcome
    /// could be produced (bad input, unknown engine, spawn failure); an
    /// unsuccessful build is an `Ok` outcome with a non-completed status.
    async fn execute(&self, input: &CompileInput) -> WorkerResult<CompileOutcome>;
}

/// Scan a build log for the surfaced error line.
///
/// The first line containing `!` or `Error` wins; otherwise a generic
/// failure string.
#[must_use]
pub fn extract_error(log: &str) -> String {
    log.lines()
        .find(|line| line.contains('!') || line.contains("Error"))
        .map_or_else(|| "compilation failed".to_owned(), |line| line.trim().to_owned())
}
