//! The combined, immutable result of one refresh cycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::local::RollingWindowAggregate;
use crate::providers::traits::PlanInfo;
use crate::providers::web::{ExtraUsage, QuotaUsage, RemoteUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSnapshot {
    /// Current rolling session utilization, 0..=1
    pub session_pct: f64,
    pub session_resets_at: Option<DateTime<Utc>>,
    /// Weekly utilization across all models, 0..=1
    pub weekly_pct: f64,
    pub weekly_resets_at: Option<DateTime<Utc>>,
    /// Weekly utilization for the single-model (Sonnet) quota, 0..=1
    pub sonnet_pct: f64,
    pub sonnet_resets_at: Option<DateTime<Utc>>,
    pub extra_usage: Option<ExtraUsage>,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
    pub billable_input: u64,
    pub billable_total: u64,
    pub record_count: usize,
    pub session_count: usize,
    pub files_scanned: usize,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,

    pub subscription_type: String,
    pub rate_tier: String,

    pub error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl Default for CombinedSnapshot {
    fn default() -> Self {
        Self {
            session_pct: 0.0,
            session_resets_at: None,
            weekly_pct: 0.0,
            weekly_resets_at: None,
            sonnet_pct: 0.0,
            sonnet_resets_at: None,
            extra_usage: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation: 0,
            cache_read: 0,
            billable_input: 0,
            billable_total: 0,
            record_count: 0,
            session_count: 0,
            files_scanned: 0,
            window_start: None,
            window_end: None,
            subscription_type: String::new(),
            rate_tier: String::new(),
            error: None,
            last_updated: Utc::now(),
        }
    }
}

fn quota_fields(quota: Option<&QuotaUsage>) -> (f64, Option<DateTime<Utc>>) {
    quota
        .map(|q| (q.utilization, q.resets_at))
        .unwrap_or((0.0, None))
}

impl CombinedSnapshot {
    /// Merge whatever each source produced. A missing part leaves its fields
    /// at their defaults; `errors` are joined in the order given.
    pub fn assemble(
        remote: Option<&RemoteUsage>,
        local: Option<&RollingWindowAggregate>,
        plan: Option<&PlanInfo>,
        errors: &[String],
        generated_at: DateTime<Utc>,
    ) -> Self {
        let mut snapshot = Self {
            last_updated: generated_at,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            ..Self::default()
        };

        if let Some(remote) = remote {
            (snapshot.session_pct, snapshot.session_resets_at) =
                quota_fields(remote.session.as_ref());
            (snapshot.weekly_pct, snapshot.weekly_resets_at) =
                quota_fields(remote.weekly.as_ref());
            (snapshot.sonnet_pct, snapshot.sonnet_resets_at) =
                quota_fields(remote.weekly_sonnet.as_ref());
            snapshot.extra_usage = remote.extra.clone();
        }

        if let Some(local) = local {
            snapshot.input_tokens = local.totals.input_tokens;
            snapshot.output_tokens = local.totals.output_tokens;
            snapshot.cache_creation = local.totals.cache_creation_input_tokens;
            snapshot.cache_read = local.totals.cache_read_input_tokens;
            snapshot.billable_input = local.billable_input();
            snapshot.billable_total = local.billable_total();
            snapshot.record_count = local.record_count;
            snapshot.session_count = local.session_count();
            snapshot.files_scanned = local.files_scanned;
            snapshot.window_start = Some(local.window_start);
            snapshot.window_end = Some(local.window_end);
        }

        if let Some(plan) = plan {
            snapshot.subscription_type = plan.subscription_type.clone();
            snapshot.rate_tier = plan.rate_limit_tier.clone();
        }

        snapshot
    }
}
