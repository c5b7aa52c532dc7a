use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::RefreshInterval;

const APP_DIR_NAME: &str = "claude-usage-monitor";

/// Monitor configuration persisted to config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default = "default_window_hours")]
    pub window_hours: f64,
    #[serde(default)]
    pub refresh_interval: RefreshInterval,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_max_log_file_mb")]
    pub max_log_file_mb: u64,
    #[serde(default = "default_claude_dir")]
    pub claude_dir: PathBuf,
    #[serde(default = "default_keychain_service")]
    pub keychain_service: String,
    #[serde(default = "default_refresh_url")]
    pub refresh_url: String,
    #[serde(default = "default_web_base_url")]
    pub web_base_url: String,
    #[serde(default = "default_chrome_user_data_dir")]
    pub chrome_user_data_dir: PathBuf,
    #[serde(default = "default_chrome_profiles")]
    pub chrome_profiles: Vec<String>,
}

fn default_window_hours() -> f64 {
    5.0
}

fn default_initial_delay_secs() -> u64 {
    2
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_max_log_file_mb() -> u64 {
    50
}

fn default_keychain_service() -> String {
    "Claude Code-credentials".to_string()
}

fn default_refresh_url() -> String {
    "https://console.anthropic.com/v1/oauth/token".to_string()
}

fn default_web_base_url() -> String {
    "https://claude.ai".to_string()
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        log::warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

/// The Claude CLI keeps its state under ~/.claude on every platform.
fn default_claude_dir() -> PathBuf {
    home_dir().join(".claude")
}

fn default_chrome_user_data_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        home_dir()
            .join("Library")
            .join("Application Support")
            .join("Google")
            .join("Chrome")
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .unwrap_or_else(home_dir)
            .join("Google")
            .join("Chrome")
            .join("User Data")
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| home_dir().join(".config"))
            .join("google-chrome")
    }
}

fn default_chrome_profiles() -> Vec<String> {
    let mut profiles = vec!["Default".to_string()];
    profiles.extend((1..=6).map(|n| format!("Profile {}", n)));
    profiles
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            refresh_interval: RefreshInterval::default(),
            initial_delay_secs: default_initial_delay_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            max_log_file_mb: default_max_log_file_mb(),
            claude_dir: default_claude_dir(),
            keychain_service: default_keychain_service(),
            refresh_url: default_refresh_url(),
            web_base_url: default_web_base_url(),
            chrome_user_data_dir: default_chrome_user_data_dir(),
            chrome_profiles: default_chrome_profiles(),
        }
    }
}

impl MonitorConfig {
    pub fn projects_dir(&self) -> PathBuf {
        self.claude_dir.join("projects")
    }

    pub fn stats_cache_path(&self) -> PathBuf {
        self.claude_dir.join("stats-cache.json")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.claude_dir.join(".credentials.json")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_log_file_bytes(&self) -> u64 {
        self.max_log_file_mb.saturating_mul(1024 * 1024)
    }

    /// Replace values the monitor cannot work with by their defaults
    pub fn validated(mut self) -> Self {
        if !self.window_hours.is_finite() || self.window_hours <= 0.0 {
            log::warn!(
                "Invalid windowHours {}, using {}",
                self.window_hours,
                default_window_hours()
            );
            self.window_hours = default_window_hours();
        }
        self
    }
}

/// Directory holding this tool's own configuration
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| {
            log::warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        })
        .join(APP_DIR_NAME)
}

/// Config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load config from the default location
pub fn load_config() -> MonitorConfig {
    load_config_from_path(&config_path())
}

/// Load config from `path`; a missing or invalid file yields defaults.
pub fn load_config_from_path(path: &Path) -> MonitorConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No config at {}, using defaults", path.display());
            return MonitorConfig::default();
        }
        Err(e) => {
            log::warn!("Failed to read config {}: {}", path.display(), e);
            return MonitorConfig::default();
        }
    };

    match serde_json::from_str::<MonitorConfig>(&content) {
        Ok(config) => config.validated(),
        Err(e) => {
            log::warn!("Invalid config {}: {}, using defaults", path.display(), e);
            MonitorConfig::default()
        }
    }
}
