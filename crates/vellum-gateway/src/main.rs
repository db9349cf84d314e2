//! Daemon entry point: wire the platform together and run until signalled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vellum_bus::InProcessBus;
use vellum_config::{Config, LogFormat};
use vellum_doclog::{run_retention, DocLogConfig, UpdateLog};
use vellum_gateway::{ConnectionLimiter, Gateway, GatewayContext, HmacTokenVerifier, TokenVerifier};
use vellum_hub::Hub;
use vellum_jobs::{CoordinatorConfig, FsArtifactStore, JobCoordinator};
use vellum_storage::Database;
use vellum_worker::{CompileLimits, EngineCommand, SandboxExecutor};

/// Real-time and compute backbone for the Vellum document platform.
#[derive(Debug, Parser)]
#[command(name = "vellum-gateway", version, about)]
struct Args {
    /// Path to the TOML config file (defaults to ./vellum.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listener address from the config.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config =
        vellum_config::loader::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }

    init_tracing(&config);
    info!(bind = %config.gateway.bind, data_dir = %config.storage.data_dir.display(), "vellum gateway starting");

    let db = Database::open(config.storage.database_path())
        .await
        .context("opening database")?;

    // Fan-out hub over the in-process bus backend.
    let bus = Arc::new(InProcessBus::new());
    let (hub, hub_handle) = Hub::new(bus);
    tokio::spawn(hub.run());

    // Update log + retention sweep.
    let log = Arc::new(UpdateLog::new(db.clone(), doclog_config(&config)));
    let shutdown = CancellationToken::new();
    tokio::spawn(run_retention(
        Arc::clone(&log),
        config.collab.delta_retention_days,
        config.collab.cleanup_interval(),
        shutdown.clone(),
    ));

    // Compilation job system.
    let executor = Arc::new(SandboxExecutor::new(
        engine_table(&config),
        compile_limits(&config),
    ));
    let artifacts = Arc::new(FsArtifactStore::new(config.storage.artifact_dir()));
    let coordinator = Arc::new(JobCoordinator::new(
        db,
        executor,
        artifacts,
        coordinator_config(&config),
    ));
    coordinator.start().await;
    tokio::spawn(vellum_gateway::events::run_job_events(
        hub_handle.clone(),
        coordinator.subscribe(),
        shutdown.clone(),
    ));

    // WebSocket listener.
    let verifier = build_verifier(&config).context("configuring token verification")?;
    let ctx = Arc::new(GatewayContext {
        hub: hub_handle.clone(),
        log: Arc::clone(&log),
        verifier,
        limiter: ConnectionLimiter::new(config.websocket.max_connections_per_ip),
        websocket: config.websocket.clone(),
        shutdown: shutdown.clone(),
    });
    let listener = TcpListener::bind(&config.gateway.bind)
        .await
        .with_context(|| format!("binding {}", config.gateway.bind))?;
    let gateway = Gateway::new(Arc::clone(&ctx));
    let listener_task = tokio::spawn(async move { gateway.run(listener).await });

    // Periodic hub stats for operators.
    tokio::spawn(log_hub_stats(hub_handle, shutdown.clone()));

    wait_for_signal().await;
    info!("shutdown signal received");

    // Stop accepting, close sessions, drain jobs within the grace.
    shutdown.cancel();
    let _ = listener_task.await;
    coordinator.shutdown().await;
    log.flush_snapshots().await;

    info!("vellum gateway stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        },
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        },
    }
}

fn doclog_config(config: &Config) -> DocLogConfig {
    DocLogConfig {
        snapshot_interval: config.collab.snapshot_interval,
        max_updates_per_fetch: config.collab.max_updates_per_fetch,
        max_delta_bytes: config.collab.max_document_size_bytes,
        snapshot_keep: config.collab.snapshot_keep,
    }
}

fn engine_table(config: &Config) -> BTreeMap<String, EngineCommand> {
    config
        .build
        .engines
        .iter()
        .map(|(name, engine)| {
            (
                name.clone(),
                EngineCommand {
                    program: engine.program.clone(),
                    args: engine.args.clone(),
                },
            )
        })
        .collect()
}

fn compile_limits(config: &Config) -> CompileLimits {
    CompileLimits {
        wall_timeout: config.build.timeout(),
        memory_bytes: config.build.memory_cap_bytes,
        cpu_seconds: config.build.timeout_secs.saturating_mul(config.build.cpu_cap_cores),
        ..CompileLimits::default()
    }
}

fn coordinator_config(config: &Config) -> CoordinatorConfig {
    CoordinatorConfig {
        max_workers: config.build.max_workers,
        per_principal_active_jobs: config.build.per_principal_active_jobs,
        shutdown_grace: config.gateway.shutdown_grace(),
        cache_enabled: config.build.cache_enabled,
        cache_ttl: Some(config.build.cache_ttl()),
        visibility_timeout: config.build.visibility_timeout(),
        ..CoordinatorConfig::default()
    }
}

fn build_verifier(config: &Config) -> anyhow::Result<Arc<dyn TokenVerifier>> {
    if let Some(secret) = &config.auth.secret {
        return Ok(Arc::new(HmacTokenVerifier::new(secret)));
    }
    if let Some(path) = &config.auth.public_key_path {
        let verifier =
            HmacTokenVerifier::from_key_file(path).with_context(|| format!("reading key file {}", path.display()))?;
        return Ok(Arc::new(verifier));
    }
    anyhow::bail!("no auth material configured");
}

async fn log_hub_stats(hub: vellum_hub::HubHandle, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
    tick.tick().await;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = tick.tick() => match hub.stats().await {
                Ok(stats) => info!(rooms = stats.rooms, sessions = stats.sessions, "hub stats"),
                Err(e) => {
                    warn!(error = %e, "hub stats unavailable");
                    break;
                },
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        },
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
