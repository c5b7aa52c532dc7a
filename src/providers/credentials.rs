//! OAuth credential cache with keychain loading and token refresh.
//!
//! Credentials are loaded lazily from the platform secret store and held only
//! in memory. A token is considered expired 60 seconds before its real
//! expiry. When the secret store cannot be read but a refresh token is
//! already cached, the refresh endpoint is used instead.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::config::MonitorConfig;
use crate::providers::traits::{PlanInfo, PlanInfoSource};
use crate::storage::keyring::{PlatformSecretStore, SecretSource};
use crate::timestamps;

const EXPIRY_BUFFER_SECS: i64 = 60;
const DEFAULT_LIFETIME_SECS: i64 = 3600;
const WRAPPER_KEY: &str = "claudeAiOauth";
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("No credentials found in keyring or {0}")]
    NotFound(String),
    #[error("Failed to read credentials file: {0}")]
    FileRead(String),
    #[error("Credential store returned empty credentials")]
    Empty,
    #[error("Invalid JSON in credentials: {0}")]
    InvalidJson(String),
    #[error("Missing required field '{0}' in credentials")]
    MissingField(&'static str),
    #[error("Invalid value for '{0}' in credentials")]
    InvalidField(&'static str),
    #[error("No refresh token available")]
    NoRefreshToken,
    #[error("Token refresh network error: {0}")]
    Network(String),
    #[error("Token refresh failed (HTTP {status}): {body}")]
    RefreshRejected { status: u16, body: String },
    #[error("Token refresh returned invalid JSON")]
    RefreshInvalidJson,
    #[error("Token refresh response missing access token")]
    MissingAccessToken,
    #[error("Token refresh response has a malformed token field")]
    MalformedRefreshResponse,
}

pub type Result<T> = std::result::Result<T, CredentialError>;

#[derive(Clone, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub subscription_type: String,
    pub rate_limit_tier: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("subscription_type", &self.subscription_type)
            .field("rate_limit_tier", &self.rate_limit_tier)
            .finish()
    }
}

fn required_str(data: &Map<String, Value>, key: &'static str) -> Result<String> {
    match data.get(key) {
        None => Err(CredentialError::MissingField(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(CredentialError::InvalidField(key)),
    }
}

fn optional_str(data: &Map<String, Value>, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Parse a secret-store document, unwrapping the optional
/// `{"claudeAiOauth": {...}}` wrapper.
pub fn parse_credentials(raw: &str) -> Result<Credential> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CredentialError::Empty);
    }

    let document: Value =
        serde_json::from_str(raw).map_err(|e| CredentialError::InvalidJson(e.to_string()))?;
    let mut data = document
        .as_object()
        .ok_or_else(|| CredentialError::InvalidJson("expected a JSON object".into()))?;
    if let Some(inner) = data.get(WRAPPER_KEY).and_then(Value::as_object) {
        data = inner;
    }

    let access_token = required_str(data, "accessToken")?;
    let refresh_token = required_str(data, "refreshToken")?;
    let expires_at = data
        .get("expiresAt")
        .ok_or(CredentialError::MissingField("expiresAt"))?;
    let expires_at =
        timestamps::from_json(expires_at).ok_or(CredentialError::InvalidField("expiresAt"))?;

    Ok(Credential {
        access_token,
        refresh_token,
        expires_at,
        subscription_type: optional_str(data, "subscriptionType"),
        rate_limit_tier: optional_str(data, "rateLimitTier"),
    })
}

/// The two token-refresh response shapes the endpoint has used, tried in
/// order: snake_case first, then camelCase.
#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshResponse {
    Snake {
        access_token: String,
        refresh_token: Option<String>,
        /// Seconds, as a number or a numeric string
        expires_in: Option<Value>,
    },
    Camel {
        #[serde(rename = "accessToken")]
        access_token: String,
        #[serde(rename = "refreshToken")]
        refresh_token: Option<String>,
        #[serde(rename = "expiresAt")]
        expires_at: Option<Value>,
    },
}

struct RefreshedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

/// `now + secs`, or `None` when the lifetime is negative or out of range
fn expiry_after(now: DateTime<Utc>, secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let lifetime = Duration::try_milliseconds((secs * 1000.0).round() as i64)?;
    now.checked_add_signed(lifetime)
}

fn lifetime_secs(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str()?.trim().parse().ok())
}

impl RefreshResponse {
    fn resolve(self, now: DateTime<Utc>) -> RefreshedToken {
        let default_expiry = now + Duration::seconds(DEFAULT_LIFETIME_SECS);
        match self {
            RefreshResponse::Snake {
                access_token,
                refresh_token,
                expires_in,
            } => RefreshedToken {
                access_token,
                refresh_token,
                expires_at: match expires_in.as_ref().filter(|v| !v.is_null()) {
                    None => default_expiry,
                    Some(value) => lifetime_secs(value)
                        .and_then(|secs| expiry_after(now, secs))
                        .unwrap_or_else(|| {
                            log::warn!("Ignoring unusable expires_in {}, assuming one hour", value);
                            default_expiry
                        }),
                },
            },
            RefreshResponse::Camel {
                access_token,
                refresh_token,
                expires_at,
            } => RefreshedToken {
                access_token,
                refresh_token,
                expires_at: expires_at
                    .as_ref()
                    .and_then(timestamps::from_json)
                    .unwrap_or(default_expiry),
            },
        }
    }
}

fn parse_refresh_response(body: &str, now: DateTime<Utc>) -> Result<RefreshedToken> {
    let value: Value = serde_json::from_str(body).map_err(|_| CredentialError::RefreshInvalidJson)?;
    let response = RefreshResponse::deserialize(&value).map_err(|_| {
        let has_token = ["access_token", "accessToken"]
            .iter()
            .any(|key| value.get(*key).is_some_and(|v| !v.is_null()));
        if has_token {
            CredentialError::MalformedRefreshResponse
        } else {
            CredentialError::MissingAccessToken
        }
    })?;
    Ok(response.resolve(now))
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

pub struct CredentialStore {
    source: Arc<dyn SecretSource>,
    client: reqwest::Client,
    refresh_url: String,
    cached_token: Option<String>,
    cached_refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    subscription_type: String,
    rate_limit_tier: String,
}

impl CredentialStore {
    pub fn new(source: Arc<dyn SecretSource>, client: reqwest::Client, refresh_url: impl Into<String>) -> Self {
        Self {
            source,
            client,
            refresh_url: refresh_url.into(),
            cached_token: None,
            cached_refresh_token: None,
            expires_at: None,
            subscription_type: String::new(),
            rate_limit_tier: String::new(),
        }
    }

    pub fn from_config(config: &MonitorConfig, client: reqwest::Client) -> Self {
        let source = PlatformSecretStore::new(&config.keychain_service, config.credentials_path());
        Self::new(Arc::new(source), client, &config.refresh_url)
    }

    fn is_expired(&self) -> bool {
        match (&self.cached_token, self.expires_at) {
            (Some(_), Some(expires_at)) => {
                Utc::now() >= expires_at - Duration::seconds(EXPIRY_BUFFER_SECS)
            }
            _ => true,
        }
    }

    /// Expiry of the cached token, if one is cached
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.cached_token.as_ref().and(self.expires_at)
    }

    async fn load_credentials(&mut self) -> Result<()> {
        let source = Arc::clone(&self.source);
        let raw = tokio::task::spawn_blocking(move || source.read())
            .await
            .map_err(|e| CredentialError::StoreUnavailable(e.to_string()))??;
        let credential = parse_credentials(&raw)?;
        log::debug!("Loaded credentials from secret store: {:?}", credential);

        self.cached_token = Some(credential.access_token);
        self.cached_refresh_token = Some(credential.refresh_token);
        self.expires_at = Some(credential.expires_at);
        self.subscription_type = credential.subscription_type;
        self.rate_limit_tier = credential.rate_limit_tier;
        Ok(())
    }

    async fn refresh_token(&mut self) -> Result<()> {
        let refresh_token = self
            .cached_refresh_token
            .clone()
            .ok_or(CredentialError::NoRefreshToken)?;

        let response = self
            .client
            .post(&self.refresh_url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await
            .map_err(|e| CredentialError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CredentialError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(CredentialError::RefreshRejected {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let refreshed = parse_refresh_response(&body, Utc::now())?;
        self.cached_token = Some(refreshed.access_token);
        if let Some(token) = refreshed.refresh_token {
            self.cached_refresh_token = Some(token);
        }
        self.expires_at = Some(refreshed.expires_at);
        log::info!("Access token refreshed, valid until {}", refreshed.expires_at);
        Ok(())
    }

    fn current_token(&self) -> Result<String> {
        self.cached_token
            .clone()
            .ok_or(CredentialError::MissingAccessToken)
    }

    /// Return a valid access token, loading or refreshing as needed
    pub async fn get_token(&mut self) -> Result<String> {
        if !self.is_expired() {
            return self.current_token();
        }

        if let Err(e) = self.load_credentials().await {
            if self.cached_refresh_token.is_none() {
                return Err(e);
            }
            log::warn!("Secret store read failed ({}), refreshing with cached token", e);
            self.refresh_token().await?;
            return self.current_token();
        }

        if self.is_expired() && self.cached_refresh_token.is_some() {
            self.refresh_token().await?;
        }
        self.current_token()
    }

    async fn ensure_loaded(&mut self) {
        if let Err(e) = self.load_credentials().await {
            log::debug!("Plan info unavailable: {}", e);
        }
    }

    /// Subscription tier label; empty when unknown
    pub async fn subscription_type(&mut self) -> String {
        if self.subscription_type.is_empty() {
            self.ensure_loaded().await;
        }
        self.subscription_type.clone()
    }

    /// Rate-limit tier label; empty when unknown
    pub async fn rate_limit_tier(&mut self) -> String {
        if self.rate_limit_tier.is_empty() {
            self.ensure_loaded().await;
        }
        self.rate_limit_tier.clone()
    }
}

#[async_trait]
impl PlanInfoSource for CredentialStore {
    async fn plan_info(&mut self) -> PlanInfo {
        PlanInfo {
            subscription_type: self.subscription_type().await,
            rate_limit_tier: self.rate_limit_tier().await,
        }
    }
}
