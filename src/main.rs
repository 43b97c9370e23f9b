#![forbid(unsafe_code)]

//! `qual-sequencer`: hardware qualification test sequencer.
//!
//! Bootstraps configuration, the session history database, the process
//! launcher, the result channel endpoint, the orchestrator task, and the
//! IPC server for `qual-ctl`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use qualification_sequencer::config::GlobalConfig;
use qualification_sequencer::ipc::spawn_ipc_server;
use qualification_sequencer::launcher::{CommandLauncher, ProcessLauncher};
use qualification_sequencer::manifest::loader::TomlManifestStore;
use qualification_sequencer::manifest::ManifestStore;
use qualification_sequencer::orchestrator::{
    inbox, result_channel, spawn_orchestrator, LogSurface, Orchestrator, ResultChannel,
};
use qualification_sequencer::persistence::session_repo::SessionRepo;
use qualification_sequencer::persistence::{db, retention};
use qualification_sequencer::report::{HttpInventorySink, ReportPublisher, ReportSink};
use qualification_sequencer::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "qual-sequencer", about = "Hardware qualification test sequencer", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("qual-sequencer bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    info!(manifest_dir = %config.manifest_dir.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path()).await?);
    let repo = SessionRepo::new(Arc::clone(&db));
    match repo.interrupt_stale().await {
        Ok(0) => {}
        Ok(count) => warn!(count, "sessions left active by a previous run marked cancelled"),
        Err(err) => error!(%err, "failed to reconcile stale sessions"),
    }
    info!("database connected");

    // ── Start retention service ──────────────────────────
    let ct = CancellationToken::new();
    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&db), config.history_retention_days, ct.clone());

    // ── Collaborators ───────────────────────────────────
    let manifests: Arc<dyn ManifestStore> =
        Arc::new(TomlManifestStore::open(config.manifest_dir.clone())?);
    let launcher: Arc<dyn ProcessLauncher> = Arc::new(CommandLauncher::from_config(&config));

    let sink: Option<Arc<dyn ReportSink>> = match config.inventory {
        Some(ref inventory) => Some(Arc::new(HttpInventorySink::new(inventory)?)),
        None => {
            info!("inventory not configured; reports are written locally only");
            None
        }
    };
    let publisher = ReportPublisher::new(sink, config.results_dir.clone());

    // ── Orchestrator and result channel ─────────────────
    let (handle, inbox_rx) = inbox::channel();
    let bind = SocketAddr::from((Ipv4Addr::LOCALHOST, config.result_channel_port));
    let listener = result_channel::bind(bind).await?;
    let channel = ResultChannel::new(handle.sender(), format!("http://{bind}/result"));

    let orchestrator = Orchestrator::new(
        Arc::clone(&manifests),
        launcher,
        Arc::new(LogSurface),
        publisher,
        channel.clone(),
    )
    .with_history(repo);
    let orchestrator_handle =
        spawn_orchestrator(orchestrator, inbox_rx, config.tick_interval(), ct.clone());

    let channel_ct = ct.clone();
    let channel_handle = tokio::spawn(async move {
        if let Err(err) = result_channel::serve(channel, listener, channel_ct).await {
            error!(%err, "result channel failed");
        }
    });

    if config.ipc_auth_token.is_none() {
        info!("ipc auth disabled; any local user may control sessions");
    }
    let ipc_handle = spawn_ipc_server(
        config.ipc_name.clone(),
        handle,
        manifests,
        config.ipc_auth_token.clone(),
        ct.clone(),
    )?;

    info!("qual-sequencer ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // The orchestrator tears down any active session before it exits.
    let _ = tokio::join!(orchestrator_handle, channel_handle, ipc_handle, retention_handle);
    info!("qual-sequencer shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
