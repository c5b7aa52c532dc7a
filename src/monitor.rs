//! Refresh orchestration
//!
//! One [`UsageMonitor`] owns the three usage sources. A refresh queries all of
//! them concurrently, the network-backed ones under a timeout, and folds every
//! failure into the snapshot's error field instead of returning it. Refreshes are serialized
//! and a caller that queued behind a refresh which completed meanwhile gets
//! that refresh's snapshot.

use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::config::MonitorConfig;
use crate::providers::local::{window_from_hours, LocalUsageAggregator, RollingWindowAggregate};
use crate::providers::traits::{LocalUsageSource, PlanInfo, PlanInfoSource, RemoteUsageSource};
use crate::providers::web::{http_client, RemoteUsage, WebUsageClient};
use crate::providers::CredentialStore;
use crate::snapshot::CombinedSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLabel {
    Web,
    Logs,
    Keychain,
}

impl fmt::Display for SourceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceLabel::Web => "Web",
            SourceLabel::Logs => "Logs",
            SourceLabel::Keychain => "Keychain",
        };
        f.write_str(label)
    }
}

pub type SnapshotReceiver = watch::Receiver<Option<Arc<CombinedSnapshot>>>;

pub struct UsageMonitor {
    remote: Mutex<Box<dyn RemoteUsageSource>>,
    local: Arc<dyn LocalUsageSource>,
    /// Held by the blocking scan itself, so it outlives an abandoned refresh
    local_scan: Arc<Mutex<()>>,
    plan: Mutex<Box<dyn PlanInfoSource>>,
    window_hours: f64,
    timeout: Duration,
    in_flight: Mutex<()>,
    generation: AtomicU64,
    latest: watch::Sender<Option<Arc<CombinedSnapshot>>>,
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, String>
where
    F: Future<Output = Result<T, String>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(format!("Timed out after {}s", timeout.as_secs_f64())),
    }
}

fn settle<T>(label: SourceLabel, result: Result<T, String>, errors: &mut Vec<String>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(message) => {
            log::warn!("{} fetch failed: {}", label, message);
            errors.push(format!("{}: {}", label, message));
            None
        }
    }
}

impl UsageMonitor {
    pub fn new(
        remote: Box<dyn RemoteUsageSource>,
        local: Arc<dyn LocalUsageSource>,
        plan: Box<dyn PlanInfoSource>,
        window_hours: f64,
        timeout: Duration,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            remote: Mutex::new(remote),
            local,
            local_scan: Arc::new(Mutex::new(())),
            plan: Mutex::new(plan),
            window_hours,
            timeout,
            in_flight: Mutex::new(()),
            generation: AtomicU64::new(0),
            latest,
        }
    }

    /// Wire up the Chrome-backed web client, the log aggregator and the
    /// platform credential store.
    pub fn from_config(config: &MonitorConfig) -> Self {
        let client = http_client(config.http_timeout());
        Self::new(
            Box::new(WebUsageClient::from_config(config, client.clone())),
            Arc::new(LocalUsageAggregator::from_config(config)),
            Box::new(CredentialStore::from_config(config, client)),
            config.window_hours,
            config.http_timeout(),
        )
    }

    /// Most recently published snapshot
    pub fn latest(&self) -> Option<Arc<CombinedSnapshot>> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> SnapshotReceiver {
        self.latest.subscribe()
    }

    /// Run one refresh cycle and publish its snapshot.
    ///
    /// Dropping the returned future abandons in-flight requests and publishes
    /// nothing.
    pub async fn refresh(&self) -> Arc<CombinedSnapshot> {
        let observed = self.generation.load(Ordering::SeqCst);
        let _guard = self.in_flight.lock().await;
        if self.generation.load(Ordering::SeqCst) != observed {
            if let Some(snapshot) = self.latest() {
                log::debug!("Refresh coalesced with the one that just finished");
                return snapshot;
            }
        }

        let snapshot = Arc::new(self.collect().await);
        log::debug!("Publishing snapshot: {:?}", snapshot);
        self.latest.send_replace(Some(Arc::clone(&snapshot)));
        self.generation.fetch_add(1, Ordering::SeqCst);
        snapshot
    }

    async fn fetch_remote(&self) -> Result<RemoteUsage, String> {
        with_timeout(self.timeout, async {
            let mut remote = self.remote.lock().await;
            remote.fetch_usage().await.map_err(|e| e.to_string())
        })
        .await
    }

    /// Local scans only touch the filesystem and are awaited without a
    /// timeout. A scan left running by a dropped refresh finishes before the
    /// next one starts.
    async fn aggregate_local(&self) -> Result<RollingWindowAggregate, String> {
        let local = Arc::clone(&self.local);
        let window = window_from_hours(self.window_hours);
        let scan = Arc::clone(&self.local_scan).lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _scan = scan;
            local.aggregate(window)
        })
        .await
        .map_err(|e| e.to_string())
    }

    async fn fetch_plan(&self) -> Result<PlanInfo, String> {
        with_timeout(self.timeout, async {
            let mut plan = self.plan.lock().await;
            Ok(plan.plan_info().await)
        })
        .await
    }

    async fn collect(&self) -> CombinedSnapshot {
        let (remote, local, plan) =
            tokio::join!(self.fetch_remote(), self.aggregate_local(), self.fetch_plan());

        let mut errors = Vec::new();
        let remote = settle(SourceLabel::Web, remote, &mut errors);
        let local = settle(SourceLabel::Logs, local, &mut errors);
        let plan = settle(SourceLabel::Keychain, plan, &mut errors);

        CombinedSnapshot::assemble(
            remote.as_ref(),
            local.as_ref(),
            plan.as_ref(),
            &errors,
            Utc::now(),
        )
    }
}
