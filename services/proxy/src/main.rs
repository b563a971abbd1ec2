//! wol-proxy
//!
//! Stable always-on endpoint in front of hosts that sleep. Each configured
//! service listens locally, wakes its target with a Wake-on-LAN magic packet
//! on first contact, and forwards traffic once the target is reachable.
//!
//! Exit codes: 0 on clean shutdown, 1 when no service could be started.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use wolp_proxy::logging::{self, LogFormat};
use wolp_proxy::{Config, ProxyManager, ShutdownPolicy};

#[derive(Debug, Parser)]
#[command(name = "wol-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Options document (JSON, or TOML when the file ends in .toml).
    #[arg(long, env = "WOLP_CONFIG", default_value = "/data/options.json")]
    config: PathBuf,

    /// Log level; overrides the document's log_level. RUST_LOG wins over both.
    #[arg(long, env = "WOLP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format.
    #[arg(long, env = "WOLP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Seconds in-flight sessions get to finish on shutdown.
    #[arg(long, env = "WOLP_DRAIN_GRACE_SECS", default_value_t = 5)]
    drain_grace_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            // The subscriber may not be installed yet.
            eprintln!("wol-proxy: {:#}", e);
            error!(error = %format!("{:#}", e), "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    logging::init(level, cli.log_format).context("failed to initialize logging")?;

    info!("Starting wol-proxy");
    for rejected in &config.rejected {
        error!(
            reason = rejected.reason_code(),
            error = %rejected,
            "service excluded by configuration"
        );
    }
    info!(
        config_path = %cli.config.display(),
        services = config.services.len(),
        rejected = config.rejected.len(),
        "Configuration loaded"
    );

    let policy = ShutdownPolicy {
        drain_grace: std::time::Duration::from_secs(cli.drain_grace_secs),
    };
    let manager = ProxyManager::start(config.services, policy)
        .await
        .context("failed to start services")?;

    if manager.is_empty() {
        error!("no service could be started");
        return Ok(ExitCode::FAILURE);
    }

    shutdown_signal().await;
    info!("Received shutdown signal");

    manager.stop().await;
    info!("wol-proxy shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
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
                warn!(error = %e, "failed to listen for SIGTERM");
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
