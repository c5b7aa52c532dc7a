use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

use claude_usage_monitor::config::{self, MonitorConfig};
use claude_usage_monitor::providers::web::http_client;
use claude_usage_monitor::providers::CredentialStore;
use claude_usage_monitor::render;
use claude_usage_monitor::scheduler::{self, RefreshInterval};
use claude_usage_monitor::{CombinedSnapshot, UsageMonitor};

#[derive(Parser)]
#[command(name = "claude-usage-monitor")]
#[command(about = "Tracks Claude session and weekly quota usage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Refresh once, print the snapshot and exit
    #[arg(long)]
    once: bool,

    /// Print snapshots as JSON
    #[arg(long)]
    json: bool,

    /// Rolling window for local log totals, in hours
    #[arg(long)]
    window_hours: Option<f64>,

    /// Refresh interval: manual, 1m, 2m, 5m or 15m
    #[arg(long)]
    interval: Option<RefreshInterval>,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Check the stored Claude credentials without printing the token
    Auth,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            anyhow::ensure!(path.is_file(), "Config file not found: {}", path.display());
            config::load_config_from_path(path)
        }
        None => config::load_config(),
    };
    if let Some(hours) = cli.window_hours {
        anyhow::ensure!(hours.is_finite() && hours > 0.0, "--window-hours must be a positive number");
        config.window_hours = hours;
    }
    if let Some(interval) = cli.interval {
        config.refresh_interval = interval;
    }

    match cli.command {
        Some(Command::Auth) => run_auth(&config).await,
        None if cli.once => run_once(&config, cli.json).await,
        None => run_watch(config, cli.json).await,
    }
}

fn print_snapshot(snapshot: &CombinedSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    } else {
        for line in render::summary_lines(snapshot, Utc::now()) {
            println!("{}", line);
        }
        println!();
    }
    Ok(())
}

async fn run_once(config: &MonitorConfig, json: bool) -> Result<()> {
    let monitor = UsageMonitor::from_config(config);
    let snapshot = monitor.refresh().await;
    print_snapshot(&snapshot, json)
}

async fn run_watch(config: MonitorConfig, json: bool) -> Result<()> {
    let monitor = Arc::new(UsageMonitor::from_config(&config));
    let mut updates = monitor.subscribe();
    let (handle, task) = scheduler::spawn(
        Arc::clone(&monitor),
        config.refresh_interval,
        config.initial_delay(),
    );

    // Each line on stdin asks for an immediate refresh
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    print_snapshot(&snapshot, json)?;
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(_)) => {
                    if !handle.request_refresh() {
                        log::debug!("Refresh already pending");
                    }
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }

    handle.shutdown();
    task.await.context("Scheduler task failed")?;
    Ok(())
}

async fn run_auth(config: &MonitorConfig) -> Result<()> {
    let mut store = CredentialStore::from_config(config, http_client(config.http_timeout()));
    store
        .get_token()
        .await
        .context("Failed to obtain an access token")?;

    let expires = store
        .expires_at()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    let or_unknown = |s: String| if s.is_empty() { "unknown".to_string() } else { s };

    println!("Access token valid until {}", expires);
    println!("Subscription: {}", or_unknown(store.subscription_type().await));
    println!("Rate limit tier: {}", or_unknown(store.rate_limit_tier().await));
    Ok(())
}
