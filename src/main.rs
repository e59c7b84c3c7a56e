use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use pingwatch::config::Config;
use pingwatch::export::health::HealthMetrics;
use pingwatch::monitor::Monitor;
use pingwatch::probe::ProbeProcess;
use pingwatch::store::InfluxStore;

/// Continuous fping latency monitor writing to InfluxDB.
#[derive(Parser)]
#[command(name = "pingwatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("pingwatch {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting pingwatch",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let targets = cfg.targets();

    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    health.targets.set(targets.len() as f64);
    if cfg.health.enabled {
        health.start().await.context("starting health server")?;
    }

    tracing::info!(
        influxdb = %cfg.influxdb.base_url(),
        database = %cfg.influxdb.dbname,
        targets = targets.len(),
        "configuration loaded",
    );

    let store = InfluxStore::new(cfg.influxdb.clone())?;
    let mut monitor = Monitor::new(store, Arc::clone(&health));

    let result = monitor
        .run(|| ProbeProcess::spawn_fping(&cfg.probe, &targets), cancel)
        .await;

    health.stop().await;

    let stats = result?;
    tracing::info!(
        points = stats.points,
        timeouts = stats.timeouts,
        malformed = stats.malformed,
        "pingwatch stopped",
    );

    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });

    Ok(())
}
