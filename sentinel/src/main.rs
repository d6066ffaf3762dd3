//! Sentinel — the Medic monitor daemon process.
//!
//! Provides `start` (run the monitor loop) and `check` (one-shot
//! diagnostic pass) subcommands, mirroring the teacher's
//! `flatline::main`'s `Command::{Start,Check}` split.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use medic::alert_router::{default_senders, AlertRouter};
use medic::circuit_breaker::CircuitBreakerConfig;
use medic::config::{config_dir, load_config, MedicConfig};
use medic::monitor::{Monitor, ScheduleConfig};
use medic::store::Store;
use medic::url_validator::UrlValidator;

/// Sentinel — the Medic monitor daemon.
#[derive(Parser)]
#[command(name = "sentinel", version, about)]
struct Cli {
    /// Path to `medic.toml`. Defaults to `~/.medic/medic.toml`.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Path to the SQLite store. Defaults to `~/.medic/medic.db`.
    #[arg(long, global = true)]
    store: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the monitor daemon loop.
    Start,
    /// Run a single monitor tick and exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start(&cli).await,
        Command::Check => handle_check(&cli).await,
    }
}

fn resolve_paths(cli: &Cli) -> anyhow::Result<(std::path::PathBuf, std::path::PathBuf)> {
    let config_path = match &cli.config {
        Some(p) => p.clone(),
        None => config_dir()?.join("medic.toml"),
    };
    let store_path = match &cli.store {
        Some(p) => p.clone(),
        None => config_dir()?.join("medic.db"),
    };
    Ok((config_path, store_path))
}

fn load_or_default_config(path: &std::path::Path) -> anyhow::Result<MedicConfig> {
    if path.exists() {
        load_config(path, |k| std::env::var(k).ok()).with_context(|| format!("failed to load {}", path.display()))
    } else {
        Ok(MedicConfig::default())
    }
}

fn build_router() -> AlertRouter {
    let client = reqwest::Client::new();
    let validator = Arc::new(UrlValidator::from_env(|k| std::env::var(k).ok()));
    let slack_bot_token = std::env::var("MEDIC_SLACK_BOT_TOKEN").ok();
    AlertRouter::new(default_senders(client, validator, slack_bot_token))
}

fn build_schedule(config: &MedicConfig) -> ScheduleConfig {
    let timezone = config.monitor.schedule_timezone.parse().unwrap_or_else(|_| {
        warn!(timezone = %config.monitor.schedule_timezone, "unrecognized schedule timezone, falling back to UTC");
        chrono_tz::UTC
    });
    ScheduleConfig {
        timezone,
        business_hours_start_hour: config.monitor.business_hours_start_hour,
        business_hours_end_hour: config.monitor.business_hours_end_hour,
    }
}

/// Run the monitor daemon: tick the sweep every `monitor.tick_secs`.
async fn handle_start(cli: &Cli) -> anyhow::Result<()> {
    let (config_path, store_path) = resolve_paths(cli)?;

    let logs_dir = config_dir()?.join("logs");
    let _logging_guard = medic::logging::init_production(&logs_dir)?;

    let config = load_or_default_config(&config_path)?;
    let store = Arc::new(
        Store::open(&store_path)
            .await
            .with_context(|| format!("failed to open medic store at {}", store_path.display()))?,
    );
    let router = Arc::new(build_router());
    let circuit_breaker_config = CircuitBreakerConfig {
        window_secs: config.circuit_breaker.window_secs,
        max_executions: config.circuit_breaker.max_executions,
    };
    let monitor = Monitor::with_schedule(store, router, circuit_breaker_config, build_schedule(&config), config.monitor.worker_concurrency);

    info!(
        config = %config_path.display(),
        store = %store_path.display(),
        tick_secs = config.monitor.tick_secs,
        "sentinel monitor daemon started"
    );

    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(config.monitor.tick_secs));
    loop {
        interval.tick().await;
        let summary = monitor.tick(chrono::Utc::now()).await;
        if summary.errors > 0 {
            warn!(?summary, "monitor tick completed with errors");
        } else {
            info!(?summary, "monitor tick complete");
        }
    }
}

/// Run a single monitor tick and report the result.
async fn handle_check(cli: &Cli) -> anyhow::Result<()> {
    medic::logging::init_cli();
    let (config_path, store_path) = resolve_paths(cli)?;

    let config = load_or_default_config(&config_path)?;
    let store = Arc::new(
        Store::open(&store_path)
            .await
            .with_context(|| format!("failed to open medic store at {}", store_path.display()))?,
    );
    let router = Arc::new(build_router());
    let circuit_breaker_config = CircuitBreakerConfig {
        window_secs: config.circuit_breaker.window_secs,
        max_executions: config.circuit_breaker.max_executions,
    };
    let monitor = Monitor::with_schedule(store, router, circuit_breaker_config, build_schedule(&config), config.monitor.worker_concurrency);

    let summary = monitor.tick(chrono::Utc::now()).await;
    info!(?summary, "check complete");
    Ok(())
}
