//! UPS Synchronization Daemon
//!
//! Main entry point for the upssyncd daemon.
//! Polls apcupsd NIS servers and publishes UPS state until signalled.

use anyhow::Context;
use clap::Parser;
use sonic_upssyncd::{
    InMemoryStore, Lifecycle, RedisStore, StateStore, StoreBackend, UpsSyncDaemon, UpssyncConfig,
    config_file::DEFAULT_CONFIG_PATH,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// SONiC UPS synchronization daemon
#[derive(Parser, Debug)]
#[command(name = "upssyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("upssyncd: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => {
            info!("upssyncd: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "upssyncd: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {:?}", level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = UpssyncConfig::load_or_default(&args.config)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    if args.check_config {
        info!(path = %args.config.display(), "Configuration is valid");
        return Ok(());
    }

    let store = open_store(&config).await?;
    let daemon = UpsSyncDaemon::new(config, store)?;
    let mut lifecycle = Lifecycle::new(daemon);
    lifecycle.on_ready()?;

    tokio::select! {
        _ = shutdown_signal() => info!("upssyncd: Received shutdown signal"),
        _ = lifecycle.daemon().stopped() => {}
    }

    lifecycle
        .on_shutdown(|| info!("upssyncd: Shutdown complete"))
        .await;

    match lifecycle.daemon().fatal_error() {
        Some(e) => Err(anyhow::anyhow!("{}", e)),
        None => Ok(()),
    }
}

async fn open_store(config: &UpssyncConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    let db = &config.database;
    match db.backend {
        StoreBackend::Memory => {
            info!("Using in-memory state store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&db.redis_host, db.redis_port, db.redis_db)
                .await
                .with_context(|| {
                    format!("failed to connect to Redis at {}:{}", db.redis_host, db.redis_port)
                })?;
            info!(
                host = %db.redis_host,
                port = db.redis_port,
                db = db.redis_db,
                "Connected to Redis"
            );
            Ok(Arc::new(store))
        }
    }
}

/// SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
