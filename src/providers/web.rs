//! claude.ai usage API client
//!
//! Auth: browser session cookie (`sessionKey`) read from a local Chrome profile
//! API: `/api/organizations` then `/api/organizations/{uuid}/usage`
//!
//! ## Data Available
//! - Five hour session utilization + reset
//! - Seven day utilization (all models, Sonnet only) + reset
//! - Extra usage spend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, COOKIE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MonitorConfig;
use crate::providers::cookies::ChromeCookieStore;
use crate::providers::traits::RemoteUsageSource;
use crate::timestamps;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum RemoteUsageError {
    #[error("Browser cookie store unavailable: {0}")]
    CookieStoreUnavailable(String),
    #[error("No Chrome profile found with claude.ai session. Please log in to claude.ai in Chrome first.")]
    NoSession,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Session expired (HTTP {0}). Please refresh claude.ai in Chrome.")]
    SessionExpired(u16),
    #[error("API error (HTTP {0})")]
    Http(u16),
    #[error("Invalid JSON from usage API: {0}")]
    InvalidJson(String),
    #[error("No organizations found")]
    NoOrganizations,
}

pub type Result<T> = std::result::Result<T, RemoteUsageError>;

/// Utilization of one quota class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Fraction of the quota consumed, 0..=1
    pub utilization: f64,
    pub resets_at: Option<DateTime<Utc>>,
}

/// Pay-as-you-go overage beyond the plan quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraUsage {
    pub spent: f64,
    pub limit: f64,
    pub utilization: f64,
}

/// Normalized response of the usage endpoint. Absent classes stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteUsage {
    pub session: Option<QuotaUsage>,
    pub weekly: Option<QuotaUsage>,
    pub weekly_sonnet: Option<QuotaUsage>,
    pub extra: Option<ExtraUsage>,
}

#[derive(Clone, PartialEq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
}

impl std::fmt::Debug for BrowserCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserCookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Cookies of the first browser profile holding a live session
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserSession {
    pub profile: String,
    pub cookies: Vec<BrowserCookie>,
}

impl BrowserSession {
    fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Locates a logged-in claude.ai browser session
pub trait SessionCookieSource: Send + Sync {
    fn find_session(&self) -> Result<BrowserSession>;
}

fn number(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Empty objects and nulls count as absent.
fn present<'a>(data: &'a Value, key: &str) -> Option<&'a Value> {
    data.get(key)
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
}

fn quota(data: &Value, key: &str) -> Option<QuotaUsage> {
    present(data, key).map(|q| QuotaUsage {
        utilization: number(q, "utilization"),
        resets_at: q
            .get("resets_at")
            .and_then(Value::as_str)
            .and_then(timestamps::parse_iso),
    })
}

/// Map the usage endpoint's quota objects onto [`RemoteUsage`]
pub fn normalize_usage(data: &Value) -> RemoteUsage {
    RemoteUsage {
        session: quota(data, "five_hour"),
        weekly: quota(data, "seven_day"),
        weekly_sonnet: quota(data, "seven_day_sonnet"),
        extra: present(data, "extra_usage").map(|extra| ExtraUsage {
            spent: number(extra, "spent"),
            limit: number(extra, "limit"),
            utilization: number(extra, "utilization"),
        }),
    }
}

pub struct WebUsageClient {
    cookies: Arc<dyn SessionCookieSource>,
    client: reqwest::Client,
    base_url: String,
    session: Option<BrowserSession>,
    org_uuid: Option<String>,
}

impl WebUsageClient {
    pub fn new(cookies: Arc<dyn SessionCookieSource>, client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            cookies,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: None,
            org_uuid: None,
        }
    }

    pub fn from_config(config: &MonitorConfig, client: reqwest::Client) -> Self {
        let cookies = ChromeCookieStore::from_config(config);
        Self::new(Arc::new(cookies), client, &config.web_base_url)
    }

    /// Profile the cached session came from
    pub fn profile(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.profile.as_str())
    }

    async fn cookie_header(&mut self) -> Result<String> {
        if let Some(session) = &self.session {
            return Ok(session.cookie_header());
        }

        let cookies = Arc::clone(&self.cookies);
        let session = tokio::task::spawn_blocking(move || cookies.find_session())
            .await
            .map_err(|e| RemoteUsageError::CookieStoreUnavailable(e.to_string()))??;
        log::debug!("Using claude.ai session from Chrome profile '{}'", session.profile);

        let header = session.cookie_header();
        self.session = Some(session);
        Ok(header)
    }

    fn invalidate_session(&mut self) {
        if let Some(session) = self.session.take() {
            log::info!("Dropping session from Chrome profile '{}'", session.profile);
        }
    }

    async fn api_get(&mut self, path: &str) -> Result<Value> {
        let cookie = self.cookie_header().await?;
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(ACCEPT, "application/json")
            .header(COOKIE, cookie)
            .send()
            .await
            .map_err(|e| RemoteUsageError::Network(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            code @ (401 | 403) => {
                self.invalidate_session();
                return Err(RemoteUsageError::SessionExpired(code));
            }
            code if !status.is_success() => return Err(RemoteUsageError::Http(code)),
            _ => {}
        }

        let body = response
            .text()
            .await
            .map_err(|e| RemoteUsageError::Network(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| RemoteUsageError::InvalidJson(e.to_string()))
    }

    async fn org_uuid(&mut self) -> Result<String> {
        if let Some(uuid) = &self.org_uuid {
            return Ok(uuid.clone());
        }

        let orgs = self.api_get("/api/organizations").await?;
        let uuid = orgs
            .as_array()
            .and_then(|orgs| orgs.first())
            .and_then(|org| org.get("uuid"))
            .and_then(Value::as_str)
            .ok_or(RemoteUsageError::NoOrganizations)?
            .to_string();
        log::debug!("Detected organization {}", uuid);
        self.org_uuid = Some(uuid.clone());
        Ok(uuid)
    }
}

#[async_trait]
impl RemoteUsageSource for WebUsageClient {
    async fn fetch_usage(&mut self) -> Result<RemoteUsage> {
        let org = self.org_uuid().await?;
        let data = self.api_get(&format!("/api/organizations/{}/usage", org)).await?;
        Ok(normalize_usage(&data))
    }
}

/// Shared client for the web API and token refresh
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            log::warn!("Failed to build HTTP client with timeout: {}", e);
            reqwest::Client::new()
        })
}
