//! Client and server configuration
//!
//! Client settings live in the global link store and can be overridden from
//! the environment (a `.env` file is honoured). The server is configured
//! from CLI flags with environment fallbacks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::links::GlobalState;

pub const DEFAULT_API_URL: &str = "http://localhost:3000";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SERVER_PORT: u16 = 3000;
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: usize = 120;

/// Tunables persisted alongside the global links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonSettings {
    pub poll_interval_secs: u64,
    pub debounce_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Effective client settings for one command invocation
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_url: String,
    pub api_token: Option<String>,
    pub machine_id: Option<String>,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub request_timeout: Duration,
}

impl ClientSettings {
    /// Merge the persisted global state with environment overrides
    pub fn resolve(global: &GlobalState) -> Result<Self> {
        dotenvy::dotenv().ok();

        let api_url = env_string("ASSETSYNC_API_URL")
            .or_else(|| global.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_token = env_string("ASSETSYNC_TOKEN").or_else(|| global.api_token.clone());

        let poll_secs = env_number("ASSETSYNC_POLL_SECS")?
            .unwrap_or(global.settings.poll_interval_secs)
            .max(1);
        let debounce_ms = env_number("ASSETSYNC_DEBOUNCE_MS")?.unwrap_or(global.settings.debounce_ms);

        Ok(Self {
            api_url,
            api_token,
            machine_id: global.machine.as_ref().map(|m| m.id.clone()),
            poll_interval: Duration::from_secs(poll_secs),
            debounce: Duration::from_millis(debounce_ms),
            request_timeout: Duration::from_secs(global.settings.request_timeout_secs.max(1)),
        })
    }

    /// Machine id, or a configuration error telling the user to register
    pub fn require_machine(&self) -> Result<&str> {
        self.machine_id.as_deref().ok_or_else(|| {
            SyncError::Config("this machine is not registered; run `assetsync register`".into())
        })
    }
}

/// Client home: `$ASSETSYNC_HOME`, else `~/.assetsync`
pub fn home_dir() -> PathBuf {
    if let Some(dir) = env_string("ASSETSYNC_HOME") {
        return PathBuf::from(dir);
    }
    let user_home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    user_home.join(".assetsync")
}

/// Version authority server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub bootstrap_token: Option<String>,
    pub rate_limit_per_minute: usize,
}

impl ServerConfig {
    /// Load defaults from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: env_number("ASSETSYNC_PORT")?.unwrap_or(DEFAULT_SERVER_PORT),
            db_path: env_string("ASSETSYNC_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("assetsync.db")),
            bootstrap_token: env_string("ASSETSYNC_BOOTSTRAP_TOKEN"),
            rate_limit_per_minute: env_number("ASSETSYNC_RATE_LIMIT")?
                .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE),
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{key} must be a number, got {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default_when_missing_from_json() {
        let state: GlobalState = serde_json::from_str(r#"{"apiUrl": "http://x"}"#).unwrap();
        assert_eq!(state.settings, DaemonSettings::default());
        assert!(state.links.is_empty());
    }

    #[test]
    fn test_require_machine() {
        let mut global = GlobalState::default();
        global.settings.poll_interval_secs = 0;
        let settings = ClientSettings::resolve(&global).unwrap();
        assert!(settings.require_machine().unwrap_err().is_fatal());
        assert!(settings.poll_interval >= Duration::from_secs(1));
    }
}
