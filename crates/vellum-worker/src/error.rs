//! Worker error types.

use thiserror::Error;

/// Errors raised while preparing or launching a sandboxed build.
///
/// Note that a build that *runs* and fails is not an error; it is a
/// [`CompileOutcome`](crate::CompileOutcome) with a failed status. These
/// errors cover the cases where no outcome could be produced at all.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// An input path tried to escape the scratch tree.
    #[error("unsafe input path: {0}")]
    UnsafePath(String),

    /// The engine selector has no configured command.
    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    /// Scratch directory or input materialization failed.
    #[error("scratch setup failed: {0}")]
    Scratch(#[from] std::io::Error),

    /// The engine process could not be spawned.
    #[error("failed to spawn engine {program}: {reason}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying reason.
        reason: String,
    },
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;
