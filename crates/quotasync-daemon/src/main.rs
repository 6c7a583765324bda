//! QuotaSync Daemon - Quota-capped offload service
//!
//! This binary runs under a service supervisor and:
//! - Loads and validates the YAML configuration
//! - Opens the SQLite file ledger
//! - Runs the sync loop (watch, expire, retry, admit, transfer)
//! - Shuts down gracefully on SIGTERM/SIGINT
//!
//! Any error other than a failed transfer ends the process with a non-zero
//! status; the supervisor is expected to restart it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use quotasync_cache::{DatabasePool, SqliteLedger};
use quotasync_core::config::Config;
use quotasync_sync::engine::{EngineSettings, SyncEngine};
use quotasync_sync::transfer::RsyncMirror;
use quotasync_sync::watcher::DirectoryWatcher;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Command line
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "quotasyncd",
    version,
    about = "Offloads new files to a remote host within a size quota"
)]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }
}

/// Log level from `-v` flags, falling back to the configured one
fn effective_level(verbose: u8, configured: &str) -> &str {
    match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    }
}

/// Installs the stderr subscriber; `RUST_LOG` takes precedence when set
fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

// ============================================================================
// Startup
// ============================================================================

/// Opens the ledger, wires the engine and runs it until `shutdown`
async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    let pool = DatabasePool::new(&config.database.path)
        .await
        .context("Failed to open ledger database")?;
    let ledger = Arc::new(SqliteLedger::new(pool.pool().clone()));

    tokio::fs::create_dir_all(&config.sync.temp_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create staging directory {}",
                config.sync.temp_dir.display()
            )
        })?;

    let mirror = Arc::new(RsyncMirror::from_config(&config));
    let watcher = DirectoryWatcher::new().context("Failed to initialize directory watcher")?;

    let mut engine = SyncEngine::new(
        ledger,
        mirror,
        watcher,
        EngineSettings::from_config(&config),
    );
    engine.run(shutdown).await
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    info!("Finishing current cycle before exit");
    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config_path();

    let config = match Config::load_validated(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(effective_level(cli.verbose, "info"));
            error!(path = %config_path.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(effective_level(cli.verbose, &config.logging.level));

    if cli.check_config {
        info!(path = %config_path.display(), "Configuration OK");
        return ExitCode::SUCCESS;
    }

    info!(
        config_path = %config_path.display(),
        trees = config.directories.len(),
        "quotasyncd starting"
    );

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    match run(config, shutdown_token).await {
        Ok(()) => {
            info!("quotasyncd shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "quotasyncd exiting with error");
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
