use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::providers::local::RollingWindowAggregate;
use crate::providers::web::{RemoteUsage, RemoteUsageError};

/// Cosmetic plan labels read from the credential store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanInfo {
    pub subscription_type: String,
    pub rate_limit_tier: String,
}

/// Authoritative quota utilization from the web API
#[async_trait]
pub trait RemoteUsageSource: Send {
    /// Fetch and normalize current utilization for every quota class
    async fn fetch_usage(&mut self) -> Result<RemoteUsage, RemoteUsageError>;
}

/// Token totals reconstructed from locally written event logs
pub trait LocalUsageSource: Send + Sync {
    /// Aggregate events in `[now - window, now]`. Never fails.
    fn aggregate(&self, window: Duration) -> RollingWindowAggregate;
}

/// Subscription labels; failures are swallowed and yield empty strings
#[async_trait]
pub trait PlanInfoSource: Send {
    async fn plan_info(&mut self) -> PlanInfo;
}
