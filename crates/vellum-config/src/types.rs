//! Configuration types.
//!
//! Every struct implements [`Default`] with the platform's documented
//! defaults, and every section is `#[serde(default)]` so partial files
//! merge over the defaults field by field.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the Vellum daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener address and process lifecycle.
    pub gateway: GatewaySection,
    /// WebSocket transport timing and limits.
    pub websocket: WebSocketSection,
    /// Update log, snapshot, and retention settings.
    pub collab: CollabSection,
    /// Compilation job system settings.
    pub build: BuildSection,
    /// Token verification material.
    pub auth: AuthSection,
    /// On-disk data locations.
    pub storage: StorageSection,
    /// Logging level and format.
    pub logging: LoggingSection,
}

impl Config {
    /// Check cross-field invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.auth.secret.is_none() && self.auth.public_key_path.is_none() {
            return Err(ConfigError::Invalid(
                "one of auth.secret or auth.public_key_path must be set".to_owned(),
            ));
        }
        if self.websocket.ping_interval_secs >= self.websocket.pong_window_secs {
            return Err(ConfigError::Invalid(format!(
                "websocket.ping_interval_secs ({}) must be below pong_window_secs ({})",
                self.websocket.ping_interval_secs, self.websocket.pong_window_secs
            )));
        }
        if self.websocket.send_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "websocket.send_queue_depth must be at least 1".to_owned(),
            ));
        }
        if self.collab.snapshot_interval == 0 {
            return Err(ConfigError::Invalid(
                "collab.snapshot_interval must be at least 1".to_owned(),
            ));
        }
        if self.build.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "build.max_workers must be at least 1".to_owned(),
            ));
        }
        if self.build.engines.is_empty() {
            return Err(ConfigError::Invalid(
                "build.engines must define at least one engine".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Listener and lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// TCP address the WebSocket listener binds.
    pub bind: String,
    /// Bounded grace for draining sessions and jobs on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_owned(),
            shutdown_grace_secs: 20,
        }
    }
}

impl GatewaySection {
    /// Shutdown grace as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSection {
    /// Server ping cadence.
    pub ping_interval_secs: u64,
    /// Window within which a pong must arrive before teardown.
    pub pong_window_secs: u64,
    /// Bound on a single outbound socket write.
    pub write_wait_secs: u64,
    /// Maximum inbound message size in bytes.
    pub max_message_bytes: usize,
    /// Concurrent connections allowed per source IP.
    pub max_connections_per_ip: usize,
    /// Per-session outbound frame queue depth.
    pub send_queue_depth: usize,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: 54,
            pong_window_secs: 60,
            write_wait_secs: 10,
            max_message_bytes: 512 * 1024,
            max_connections_per_ip: 10,
            send_queue_depth: 256,
        }
    }
}

impl WebSocketSection {
    /// Ping cadence as a [`Duration`].
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Pong window as a [`Duration`].
    #[must_use]
    pub fn pong_window(&self) -> Duration {
        Duration::from_secs(self.pong_window_secs)
    }

    /// Write bound as a [`Duration`].
    #[must_use]
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

/// Update log and snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabSection {
    /// Produce a snapshot every this many versions.
    pub snapshot_interval: u64,
    /// Cap on deltas returned by a single sync fetch.
    pub max_updates_per_fetch: usize,
    /// Deltas older than this many days are reclaimable.
    pub delta_retention_days: i64,
    /// Snapshots retained per document (keep latest K).
    pub snapshot_keep: usize,
    /// Maximum accepted document delta size in bytes.
    pub max_document_size_bytes: usize,
    /// Cadence of the background retention sweep.
    pub cleanup_interval_secs: u64,
}

impl Default for CollabSection {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
            max_updates_per_fetch: 1000,
            delta_retention_days: 30,
            snapshot_keep: 5,
            max_document_size_bytes: 10 * 1024 * 1024,
            cleanup_interval_secs: 3600,
        }
    }
}

impl CollabSection {
    /// Retention sweep cadence as a [`Duration`].
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// A compile engine invocation: program plus argv template.
///
/// Occurrences of `{entry}` in `args` are replaced with the job's entry
/// file name at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Executable to run inside the sandbox.
    pub program: String,
    /// Argument template; `{entry}` expands to the entry file name.
    pub args: Vec<String>,
}

/// Compilation job system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// Hard wall-clock limit per build.
    pub timeout_secs: u64,
    /// Address-space cap per build in bytes.
    pub memory_cap_bytes: u64,
    /// CPU cores granted to a build (drives the CPU-seconds rlimit).
    pub cpu_cap_cores: u64,
    /// Concurrent sandboxed workers.
    pub max_workers: usize,
    /// Concurrent active jobs allowed per principal.
    pub per_principal_active_jobs: usize,
    /// Whether completed builds are served from the content-hash cache.
    pub cache_enabled: bool,
    /// Age beyond which a cached result is ignored.
    pub cache_ttl_secs: u64,
    /// Unacked claims become reclaimable after this long.
    pub visibility_timeout_secs: u64,
    /// Engine selector table.
    pub engines: BTreeMap<String, EngineSection>,
}

impl Default for BuildSection {
    fn default() -> Self {
        let mut engines = BTreeMap::new();
        for engine in ["pdflatex", "xelatex", "lualatex"] {
            engines.insert(
                engine.to_owned(),
                EngineSection {
                    program: engine.to_owned(),
                    args: vec![
                        "-interaction=nonstopmode".to_owned(),
                        "-halt-on-error".to_owned(),
                        "{entry}".to_owned(),
                    ],
                },
            );
        }
        Self {
            timeout_secs: 30,
            memory_cap_bytes: 2 * 1024 * 1024 * 1024,
            cpu_cap_cores: 2,
            max_workers: 10,
            per_principal_active_jobs: 5,
            cache_enabled: true,
            cache_ttl_secs: 3600,
            visibility_timeout_secs: 60,
            engines,
        }
    }
}

impl BuildSection {
    /// Build timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Cache TTL as a [`Duration`].
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Visibility timeout as a [`Duration`].
    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Token verification material: symmetric secret or public key file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Symmetric HMAC secret.
    pub secret: Option<String>,
    /// Path to an asymmetric public key, as an alternative to `secret`.
    pub public_key_path: Option<PathBuf>,
}

/// On-disk data locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Root directory for the database and artifact tree.
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StorageSection {
    /// Path of the embedded database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("vellum.db")
    }

    /// Root of the artifact tree (compilation outputs, project files).
    #[must_use]
    pub fn artifact_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-oriented terminal output.
    Pretty,
    /// Line-delimited JSON.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default tracing directive (overridable via `RUST_LOG`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Pretty,
        }
    }
}
