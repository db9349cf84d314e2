//! Sandboxed execution of one compilation job.
//!
//! A job is an engine selector, an entry file name, and a map of relative
//! paths to file contents. Execution materializes the files into a
//! scratch directory, runs the engine under resource limits with a hard
//! wall-clock deadline, and reports a [`CompileOutcome`]: status,
//! optional artifact bytes, the build log, extracted error text, and
//! elapsed milliseconds.
//!
//! The [`CompileExecutor`] trait is the coordinator's seam; tests drive
//! the job system with recording fakes while production uses
//! [`SandboxExecutor`].
//!
//! Inputs are content-addressed: [`CompileInput::fingerprint`] hashes the
//! sorted file set plus engine and entry with SHA-256, so equal inputs
//! collide on the cache regardless of insertion order.

pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod input;
pub mod sandbox;

pub use error::{WorkerError, WorkerResult};
pub use executor::{CompileExecutor, CompileOutcome, CompileStatus};
pub use fingerprint::fingerprint;
pub use input::{CompileInput, FileContent};
pub use sandbox::{CompileLimits, EngineCommand, SandboxExecutor};
