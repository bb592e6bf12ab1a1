#![forbid(unsafe_code)]

//! `agent-relay`: session orchestrator server binary.
//!
//! Bootstraps configuration, recovers orphaned workspaces, starts the idle
//! reaper and the local command server, and shuts everything down in order
//! on Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::config::GlobalConfig;
use agent_relay::ipc::server::spawn_ipc_server;
use agent_relay::orchestrator::{reaper, SessionManager};
use agent_relay::process::CliLauncher;
use agent_relay::webhook::WebhookDeliveryService;
use agent_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Headless agent session orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspace root session workspaces are created under.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match (&args.config, &args.workspace) {
        (Some(path), _) => GlobalConfig::load_from_path(path)?,
        (None, Some(workspace)) => GlobalConfig::with_workspace_root(workspace)?,
        (None, None) => {
            return Err(AppError::Config(
                "either --config or --workspace is required".into(),
            ));
        }
    };
    if let (Some(_), Some(workspace)) = (&args.config, args.workspace) {
        config.override_workspace_root(workspace)?;
    }
    config.load_credentials();

    info!(
        workspace_root = %config.workspace_root().display(),
        max_sessions = config.max_concurrent_sessions,
        host_cli = config.host_cli,
        webhook = config.webhook.url.is_some(),
        "configuration loaded"
    );

    let webhook = WebhookDeliveryService::new(config.webhook.clone())?;
    let launcher = Arc::new(CliLauncher::new(
        config.host_cli.clone(),
        config.host_cli_args.clone(),
    ));
    let ipc_name = config.ipc_name.clone();
    let reap_interval = config.reap_interval();
    let manager = SessionManager::new(config, launcher, webhook.clone());

    // Must finish before any command is accepted.
    manager.recover()?;

    let ct = CancellationToken::new();
    let reaper_handle = reaper::spawn_reaper(manager.clone(), reap_interval, ct.clone());
    let ipc_handle = spawn_ipc_server(manager.clone(), ipc_name, ct.clone())?;

    info!("agent-relay ready");
    shutdown_signal().await;
    info!("shutdown signal received");

    ct.cancel();
    for (name, handle) in [("reaper", reaper_handle), ("ipc", ipc_handle)] {
        if let Err(err) = handle.await {
            warn!(task = name, %err, "background task ended abnormally");
        }
    }

    graceful_shutdown(&manager, &webhook).await;
    info!("agent-relay stopped");
    Ok(())
}

async fn graceful_shutdown(manager: &SessionManager, webhook: &WebhookDeliveryService) {
    let report = manager.shutdown().await;
    if report.timed_out > 0 {
        warn!(timed_out = report.timed_out, "some sessions did not stop in time");
    }

    let outcome = webhook.flush().await;
    info!(?outcome, "final webhook flush complete");
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
                if let Err(err) = ctrl_c.await {
                    error!(%err, "ctrl-c signal handler failed");
                }
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
