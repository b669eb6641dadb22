#![forbid(unsafe_code)]

//! `digfleet`: fleet supervisor binary.
//!
//! Loads configuration, installs tracing, starts the fleet actor and the IPC
//! server for `digfleet-ctl`, then runs until a shutdown signal, an IPC
//! `shutdown`, or a fatal loss of connectivity.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use digfleet::client::sim::SimServer;
use digfleet::client::Connector;
use digfleet::config::LoggingConfig;
use digfleet::fleet::{FleetManager, SnapshotWriter};
use digfleet::ipc::server::{spawn_ipc_server, IpcState};
use digfleet::{AppError, FleetConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "digfleet", about = "Game session fleet supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = FleetConfig::load_from_path(&args.config)?;
    let _guard = init_tracing(args.log_format, &config.logging)?;
    info!(bots = config.bots.len(), host = %config.server.host, "digfleet bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(config))
}

async fn run(config: FleetConfig) -> Result<()> {
    let config = Arc::new(config);
    let ct = CancellationToken::new();

    // ── Fleet ───────────────────────────────────────────
    let connector: Arc<dyn Connector> = Arc::new(SimServer::from_config(&config));
    let (mut manager, control) = FleetManager::new(Arc::clone(&config), connector, ct.clone());
    if let Some(dir) = &config.logging.directory {
        manager = manager.with_snapshots(SnapshotWriter::new(dir.clone())?);
    }

    // ── IPC ─────────────────────────────────────────────
    let ipc_handle = if config.ipc.enabled {
        let state = IpcState {
            control: control.clone(),
            auth_token: config.ipc.auth_token.clone(),
        };
        Some(spawn_ipc_server(&config.ipc.name, state, ct.clone())?)
    } else {
        info!("ipc disabled");
        None
    };

    let mut fleet = tokio::spawn(manager.run().instrument(info_span!("fleet")));

    // ── Wait for exit ───────────────────────────────────
    let joined = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            if let Err(err) = control.shutdown().await {
                warn!(%err, "fleet already stopped");
            }
            (&mut fleet).await
        }
        joined = &mut fleet => joined,
    };
    ct.cancel();

    if let Some(handle) = ipc_handle {
        let _ = handle.await;
    }

    let outcome = joined.map_err(|err| AppError::Io(format!("fleet task failed: {err}")))?;
    if let Err(err) = &outcome {
        error!(%err, "fleet stopped");
    }
    info!("digfleet shut down");
    outcome
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

/// Console layer in `format`, plus a daily-rolling JSON file layer when
/// `logging.directory` is set. The returned guard flushes the file writer.
fn init_tracing(format: LogFormat, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let console = match format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    let (file, guard) = match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?;

    Ok(guard)
}
