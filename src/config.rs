//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, request timeout, and the session policy knobs (login grace
//! window, default token lifetime, refresh failure limit).
//!
//! Configuration is stored at `~/.config/opsdesk/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "opsdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Post-login grace window in seconds. Expiry checks are suppressed this long
/// after a successful login to tolerate clock skew between token issuance and
/// first use.
const DEFAULT_LOGIN_GRACE_SECS: i64 = 10;

/// Token lifetime assumed when the server omits `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_login_grace_secs")]
    pub login_grace_secs: i64,
    #[serde(default = "default_token_ttl_secs")]
    pub default_token_ttl_secs: i64,
    /// Consecutive refresh failures tolerated (while the token is expired)
    /// before the session is force-logged-out. `None` degrades indefinitely:
    /// the expired token is kept and every `ensure_valid` retries.
    #[serde(default)]
    pub refresh_failure_limit: Option<u32>,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_login_grace_secs() -> i64 {
    DEFAULT_LOGIN_GRACE_SECS
}

fn default_token_ttl_secs() -> i64 {
    DEFAULT_TOKEN_TTL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            login_grace_secs: DEFAULT_LOGIN_GRACE_SECS,
            default_token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            refresh_failure_limit: None,
        }
    }
}

impl Config {
    /// Create a config for the given API base URL with default policy values.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn login_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.login_grace_secs)
    }
}
