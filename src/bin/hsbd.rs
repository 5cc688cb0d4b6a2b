//! HSB Daemon - Hubspace accessory platform
//!
//! Supervises the worker process, registers switch accessories and keeps
//! them in sync with the cloud.
//!
//! # Usage
//!
//! ```bash
//! # Run the platform in the foreground (default)
//! hsbd start --config ~/.config/hsb/config.toml
//!
//! # Check the worker environment without starting it
//! hsbd check
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hsbd::config::{config_path, PlatformConfig};
use hsbd::platform::Platform;
use hsbd::supervisor::verify;

/// Hubspace bridge daemon
#[derive(Parser, Debug)]
#[command(name = "hsbd", version, about)]
struct Args {
    /// Config file (default: $HSB_CONFIG, then <config dir>/hsb/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the platform until interrupted
    Start,
    /// Run the worker environment checks and exit
    Check,
}

fn main() {
    let args = Args::parse();
    let path = config_path(args.config.as_deref());

    let result = match args.command.unwrap_or(Command::Start) {
        Command::Start => run_platform(path),
        Command::Check => run_check(path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("hsbd={level}").parse()?)
                .add_directive(format!("hsb_core={level}").parse()?)
                .add_directive(format!("hsb_protocol={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn run_platform(path: PathBuf) -> Result<()> {
    let config = PlatformConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    init_logging(config.debug)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        "Starting hsbd"
    );

    let platform = Platform::start(&config)
        .await
        .context("Failed to start platform")?;

    info!(
        worker_pid = ?platform.bridge().worker_pid(),
        accessories = platform.registry().list_ids().await.len(),
        "Platform running"
    );

    let failure = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal?;
            None
        }
        reason = platform.closed() => Some(reason),
    };

    info!("Shutting down...");
    platform.shutdown().await;

    if let Some(reason) = failure {
        error!(error = %reason, "Bridge stopped");
        bail!("Bridge stopped: {reason}");
    }

    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn run_check(path: PathBuf) -> Result<()> {
    let config = PlatformConfig::read(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    init_logging(config.debug)?;

    let report = verify(&config.worker)
        .await
        .context("Worker environment check failed")?;

    for line in &report.diagnostics {
        println!("ok: {line}");
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
