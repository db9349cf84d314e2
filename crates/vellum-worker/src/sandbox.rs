//! Resource-limited build execution in a scratch directory.
//!
//! The sandbox gives each build: a throwaway scratch tree (removed on
//! exit, success or not), a cleared environment, its own process group,
//! rlimit caps on address space, CPU seconds, processes, and file
//! descriptors, and a best-effort network namespace detach. The hard
//! wall-clock deadline is enforced from the parent: on expiry the whole
//! process group is killed and the outcome is a timeout.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::executor::{extract_error, CompileExecutor, CompileOutcome, CompileStatus};
use crate::input::{validate_path, CompileInput};

/// One engine's launch recipe: program plus argv template.
///
/// `{entry}` in an argument expands to the job's entry file name.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    /// Executable to run.
    pub program: String,
    /// Argument template.
    pub args: Vec<String>,
}

/// Resource caps applied to every build.
#[derive(Debug, Clone)]
pub struct CompileLimits {
    /// Hard wall-clock deadline.
    pub wall_timeout: Duration,
    /// `RLIMIT_AS` cap in bytes.
    pub memory_bytes: u64,
    /// `RLIMIT_CPU` cap in seconds.
    pub cpu_seconds: u64,
    /// `RLIMIT_NPROC` cap.
    pub max_pids: u64,
    /// `RLIMIT_NOFILE` cap.
    pub max_open_files: u64,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            wall_timeout: Duration::from_secs(30),
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_seconds: 60,
            max_pids: 128,
            max_open_files: 256,
        }
    }
}

/// Sandboxed [`CompileExecutor`] over a configured engine table.
pub struct SandboxExecutor {
    engines: BTreeMap<String, EngineCommand>,
    limits: CompileLimits,
}

impl SandboxExecutor {
    /// Create an executor with the given engine table and limits.
    #[must_use]
    pub fn new(engines: BTreeMap<String, EngineCommand>, limits: CompileLimits) -> Self {
        Self { engines, limits }
    }

    /// The artifact file a build is expected to produce: the entry file's
    /// stem with a `.pdf` extension.
    #[must_use]
    pub fn artifact_name(entry: &str) -> String {
        let stem = Path::new(entry)
            .file_stem()
            .and_then(OsStr::to_str)
            .unwrap_or(entry);
        format!("{stem}.pdf")
    }
}

#[async_trait::async_trait]
impl CompileExecutor for SandboxExecutor {
    async fn execute(&self, input: &CompileInput) -> WorkerResult<CompileOutcome> {
        let engine = self
            .engines
            .get(&input.engine)
            .ok_or_else(|| WorkerError::UnknownEngine(input.engine.clone()))?;

        let scratch = tempfile::tempdir()?;
        materialize_inputs(scratch.path(), &input.files).await?;

        let started = Instant::now();
        let mut child = spawn_engine(engine, &input.entry, scratch.path(), &self.limits)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(slurp(stdout));
        let err_task = tokio::spawn(slurp(stderr));

        let waited = tokio::time::timeout(self.limits.wall_timeout, child.wait()).await;

        let outcome = match waited {
            Ok(Ok(status)) => {
                let log = join_log(out_task.await, err_task.await);
                let duration_ms = elapsed_ms(started);
                if status.success() {
                    match tokio::fs::read(scratch.path().join(Self::artifact_name(&input.entry)))
                        .await
                    {
                        Ok(artifact) => CompileOutcome {
                            status: CompileStatus::Completed,
                            artifact: Some(artifact),
                            log,
                            error: None,
                            duration_ms,
                        },
                        Err(_) => CompileOutcome {
                            status: CompileStatus::Failed,
                            artifact: None,
                            log,
                            error: Some("engine produced no output artifact".to_owned()),
                            duration_ms,
                        },
                    }
                } else {
                    let error = status.code().map_or_else(
                        || "engine terminated by signal".to_owned(),
                        |_| extract_error(&log),
                    );
                    CompileOutcome {
                        status: CompileStatus::Failed,
                        artifact: None,
                        log,
                        error: Some(error),
                        duration_ms,
                    }
                }
            },
            Ok(Err(e)) => {
                kill_group(&child);
                return Err(WorkerError::Spawn {
                    program: engine.program.clone(),
                    reason: e.to_string(),
                });
            },
            Err(_elapsed) => {
                // Deadline expired: kill the whole process group, reap,
                // keep the log, discard any partial artifact.
                kill_group(&child);
                let _ = child.wait().await;
                let log = join_log(out_task.await, err_task.await);
                warn!(engine = %input.engine, "build exceeded wall-clock deadline");
                CompileOutcome {
                    status: CompileStatus::Timeout,
                    artifact: None,
                    log,
                    error: Some("build timed out".to_owned()),
                    duration_ms: elapsed_ms(started),
                }
            },
        };

        debug!(
            engine = %input.engine,
            status = ?outcome.status,
            duration_ms = outcome.duration_ms,
            "build finished"
        );
        Ok(outcome)
    }
}

/// Write the input file tree under the scratch root.
async fn materialize_inputs(
    scratch: &Path,
    files: &BTreeMap<String, crate::input::FileContent>,
) -> WorkerResult<()> {
    for (path, content) in files {
        // Validated at admission; re-checked here because the scratch
        // tree is the actual security boundary.
        validate_path(path)?;
        let target = scratch.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content.as_bytes()).await?;
    }
    Ok(())
}

/// Spawn the engine in its own session with limits applied.
///
/// The rlimit and `setsid` calls must run between fork and exec, which
/// is what `pre_exec` is for; that hook is inherently `unsafe`.
#[allow(unsafe_code)]
fn spawn_engine(
    engine: &EngineCommand,
    entry: &str,
    scratch: &Path,
    limits: &CompileLimits,
) -> WorkerResult<Child> {
    let mut cmd = Command::new(&engine.program);
    for arg in &engine.args {
        cmd.arg(arg.replace("{entry}", entry));
    }
    cmd.current_dir(scratch)
        .env_clear()
        .env("PATH", "/usr/local/bin:/usr/bin:/bin")
        .env("HOME", scratch)
        .env("TMPDIR", scratch)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let limits = limits.clone();
    unsafe {
        cmd.pre_exec(move || {
            apply_child_limits(&limits);
            Ok(())
        });
    }

    cmd.spawn().map_err(|e| WorkerError::Spawn {
        program: engine.program.clone(),
        reason: e.to_string(),
    })
}

/// Post-fork, pre-exec setup in the child.
///
/// Failures are ignored on purpose: a build on a platform without some
/// limit still runs, just less confined, and there is no safe way to
/// report from this context anyway.
fn apply_child_limits(limits: &CompileLimits) {
    // New session → own process group, so the parent can kill the tree.
    let _ = nix::unistd::setsid();

    let _ = setrlimit(Resource::RLIMIT_AS, limits.memory_bytes, limits.memory_bytes);
    let _ = setrlimit(Resource::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds);
    let _ = setrlimit(Resource::RLIMIT_NPROC, limits.max_pids, limits.max_pids);
    let _ = setrlimit(
        Resource::RLIMIT_NOFILE,
        limits.max_open_files,
        limits.max_open_files,
    );
    let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);

    // Best-effort network detach; requires unprivileged user namespaces.
    #[cfg(target_os = "linux")]
    let _ = nix::sched::unshare(
        nix::sched::CloneFlags::CLONE_NEWUSER | nix::sched::CloneFlags::CLONE_NEWNET,
    );
}

/// Kill the child's process group (it called `setsid`, so its pid is the
/// group id).
fn kill_group(child: &Child) {
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

async fn slurp<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

fn join_log(
    stdout: Result<String, tokio::task::JoinError>,
    stderr: Result<String, tokio::task::JoinError>,
) -> String {
    let mut log = stdout.unwrap_or_default();
    let err = stderr.unwrap_or_default();
    if !err.is_empty() {
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(&err);
    }
    log
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::FileContent;

    /// A shell-backed engine table so tests do not need TeX installed.
    fn shell_engine(script: &str) -> SandboxExecutor {
        let mut engines = BTreeMap::new();
        engines.insert(
            "shell".to_owned(),
            EngineCommand {
                program: "sh".to_owned(),
                args: vec!["-c".to_owned(), script.to_owned()],
            },
        );
        SandboxExecutor::new(engines, CompileLimits::default())
    }

    fn shell_engine_with_timeout(script: &str, timeout: Duration) -> SandboxExecutor {
        let mut executor = shell_engine(script);
        executor.limits.wall_timeout = timeout;
        executor
    }

    fn input() -> CompileInput {
        let mut input = CompileInput::new("shell", "main.tex").unwrap();
        input
            .add_file("main.tex", FileContent::Text("content\n".into()))
            .unwrap();
        input
    }

    #[test]
    fn artifact_name_uses_entry_stem() {
        assert_eq!(SandboxExecutor::artifact_name("main.tex"), "main.pdf");
        assert_eq!(SandboxExecutor::artifact_name("paper"), "paper.pdf");
    }

    #[tokio::test]
    async fn unknown_engine_is_rejected() {
        let executor = shell_engine("true");
        let mut bad = input();
        bad.engine = "pdflatex".to_owned();
        assert!(matches!(
            executor.execute(&bad).await,
            Err(WorkerError::UnknownEngine(_))
        ));
    }

    #[tokio::test]
    async fn successful_build_returns_artifact() {
        let executor = shell_engine("printf rendered > main.pdf");
        let outcome = executor.execute(&input()).await.unwrap();

        assert_eq!(outcome.status, CompileStatus::Completed);
        assert_eq!(outcome.artifact.as_deref(), Some(&b"rendered"[..]));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn inputs_are_materialized_in_the_scratch_tree() {
        // The "engine" copies its input to the artifact, proving the
        // file map landed where the build runs.
        let executor = shell_engine("cp sub/inc.tex main.pdf");
        let mut job = input();
        job.add_file("sub/inc.tex", FileContent::Text("nested".into()))
            .unwrap();

        let outcome = executor.execute(&job).await.unwrap();
        assert_eq!(outcome.status, CompileStatus::Completed);
        assert_eq!(outcome.artifact.as_deref(), Some(&b"nested"[..]));
    }

    #[tokio::test]
    async fn nonzero_exit_extracts_error_line() {
        let executor =
            shell_engine("echo 'entering main.tex'; echo '! Undefined control sequence.'; exit 1");
        let outcome = executor.execute(&input()).await.unwrap();

        assert_eq!(outcome.status, CompileStatus::Failed);
        assert!(outcome.artifact.is_none());
        assert_eq!(outcome.error.as_deref(), Some("! Undefined control sequence."));
        assert!(outcome.log.contains("entering main.tex"));
    }

    #[tokio::test]
    async fn missing_artifact_on_success_is_a_failure() {
        let executor = shell_engine("true");
        let outcome = executor.execute(&input()).await.unwrap();

        assert_eq!(outcome.status, CompileStatus::Failed);
        assert!(outcome.error.unwrap().contains("no output artifact"));
    }

    #[tokio::test]
    async fn deadline_expiry_times_the_build_out() {
        let executor = shell_engine_with_timeout(
            "echo started; sleep 30; printf late > main.pdf",
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let outcome = executor.execute(&input()).await.unwrap();

        assert_eq!(outcome.status, CompileStatus::Timeout);
        assert!(outcome.artifact.is_none());
        assert!(outcome.duration_ms >= 200);
        // The sandbox was killed promptly, not after the full sleep.
        assert!(started.elapsed() < Duration::from_secs(10));
        // The log up to the kill is preserved for diagnosis.
        assert!(outcome.log.contains("started"));
    }

    #[tokio::test]
    async fn environment_is_cleared() {
        // SAFETY-free probe: the child prints a variable that is set in
        // the parent's environment and must not leak through.
        std::env::set_var("VELLUM_SANDBOX_PROBE", "leaked");
        let executor = shell_engine("printf \"%s\" \"$VELLUM_SANDBOX_PROBE\" > main.pdf");
        let outcome = executor.execute(&input()).await.unwrap();

        assert_eq!(outcome.status, CompileStatus::Completed);
        assert_eq!(outcome.artifact.as_deref(), Some(&b""[..]));
        std::env::remove_var("VELLUM_SANDBOX_PROBE");
    }
}
