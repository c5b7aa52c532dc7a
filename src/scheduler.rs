//! Background refresh scheduler with configurable intervals

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::monitor::UsageMonitor;
use crate::snapshot::CombinedSnapshot;

const SESSION_WARNING: f64 = 0.8;
const WEEKLY_WARNING: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshInterval {
    #[serde(rename = "manual")]
    Manual,
    #[default]
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "2m")]
    TwoMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
}

impl RefreshInterval {
    pub fn to_duration(&self) -> Option<Duration> {
        match self {
            RefreshInterval::Manual => None,
            RefreshInterval::OneMinute => Some(Duration::from_secs(60)),
            RefreshInterval::TwoMinutes => Some(Duration::from_secs(120)),
            RefreshInterval::FiveMinutes => Some(Duration::from_secs(300)),
            RefreshInterval::FifteenMinutes => Some(Duration::from_secs(900)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshInterval::Manual => "manual",
            RefreshInterval::OneMinute => "1m",
            RefreshInterval::TwoMinutes => "2m",
            RefreshInterval::FiveMinutes => "5m",
            RefreshInterval::FifteenMinutes => "15m",
        }
    }
}

impl FromStr for RefreshInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "manual" => Ok(RefreshInterval::Manual),
            "1m" => Ok(RefreshInterval::OneMinute),
            "2m" => Ok(RefreshInterval::TwoMinutes),
            "5m" => Ok(RefreshInterval::FiveMinutes),
            "15m" => Ok(RefreshInterval::FifteenMinutes),
            other => Err(format!(
                "unknown refresh interval '{}' (expected manual, 1m, 2m, 5m or 15m)",
                other
            )),
        }
    }
}

/// Control side of a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    trigger: mpsc::Sender<()>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    /// Ask for a refresh as soon as the current one (if any) is done.
    /// Returns false when a request is already pending.
    pub fn request_refresh(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }

    /// Stop the loop; an in-flight refresh is abandoned.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Start the refresh loop: one refresh after `initial_delay`, then one per
/// interval tick or manual request.
pub fn spawn(
    monitor: Arc<UsageMonitor>,
    interval: RefreshInterval,
    initial_delay: Duration,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(monitor, interval, initial_delay, trigger_rx, shutdown_rx));
    let handle = SchedulerHandle {
        trigger: trigger_tx,
        shutdown: Arc::new(shutdown_tx),
    };
    (handle, task)
}

async fn next_tick(interval: RefreshInterval) {
    match interval.to_duration() {
        Some(duration) => tokio::time::sleep(duration).await,
        // Manual mode: only triggers wake us
        None => std::future::pending().await,
    }
}

async fn run(
    monitor: Arc<UsageMonitor>,
    interval: RefreshInterval,
    initial_delay: Duration,
    mut trigger: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!(
        "Scheduler started (interval {}, first refresh in {:?})",
        interval.as_str(),
        initial_delay
    );

    tokio::select! {
        _ = shutdown.changed() => return,
        _ = tokio::time::sleep(initial_delay) => {}
        Some(()) = trigger.recv() => {}
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            snapshot = monitor.refresh() => {
                check_usage_warnings(&snapshot);
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = next_tick(interval) => {}
            Some(()) = trigger.recv() => log::debug!("Manual refresh requested"),
        }
    }

    log::info!("Scheduler stopped");
}

/// Log and return a warning for each quota at or above its threshold
pub fn check_usage_warnings(snapshot: &CombinedSnapshot) -> Vec<String> {
    let mut warnings = Vec::new();

    if snapshot.session_pct >= SESSION_WARNING {
        warnings.push(format!(
            "Session usage at {:.0}%",
            snapshot.session_pct * 100.0
        ));
    }
    if snapshot.weekly_pct >= WEEKLY_WARNING {
        warnings.push(format!("Weekly usage at {:.0}%", snapshot.weekly_pct * 100.0));
    }
    if snapshot.sonnet_pct >= WEEKLY_WARNING {
        warnings.push(format!(
            "Weekly Sonnet usage at {:.0}%",
            snapshot.sonnet_pct * 100.0
        ));
    }

    for warning in &warnings {
        log::warn!("{}", warning);
    }
    warnings
}
