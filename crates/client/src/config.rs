// Client configuration file: `~/.config/notesync/client.toml`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:1234";

const DEFAULT_CONTENT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_TAGS_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_SEARCH_DEBOUNCE_MS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
/// Backoff stops doubling after this many failures.
const MAX_BACKOFF_EXPONENT: u32 = 7;

/// `~/.config/notesync/`.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("notesync"))
}

/// `~/.config/notesync/client.toml`.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("client.toml"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidUrl { field: &'static str, value: String, reason: String },
}

/// Relay reconnection parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 30_000, max_attempts: u32::MAX }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.min(MAX_BACKOFF_EXPONENT);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Notes store base URL; the API lives under `/api`.
    pub api_url: String,
    /// Collaboration relay URL (`wss://`, or `ws://` on loopback).
    pub relay_url: String,
    pub content_debounce_ms: u64,
    pub tags_debounce_ms: u64,
    pub search_debounce_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            relay_url: DEFAULT_RELAY_URL.to_string(),
            content_debounce_ms: DEFAULT_CONTENT_DEBOUNCE_MS,
            tags_debounce_ms: DEFAULT_TAGS_DEBOUNCE_MS,
            search_debounce_ms: DEFAULT_SEARCH_DEBOUNCE_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `~/.config/notesync/client.toml`. Returns defaults if the
    /// file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        config_path().and_then(|path| Self::load_from(&path).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api_url()?;
        self.relay_url()?;
        Ok(())
    }

    pub fn api_url(&self) -> Result<Url, ConfigError> {
        let parsed = parse_url("api_url", &self.api_url)?;
        match parsed.scheme() {
            "https" | "http" => Ok(parsed),
            other => Err(invalid("api_url", &self.api_url, format!("unsupported scheme `{other}`"))),
        }
    }

    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        let parsed = parse_url("relay_url", &self.relay_url)?;
        match parsed.scheme() {
            "wss" => Ok(parsed),
            "ws" if is_loopback_host(parsed.host_str()) => Ok(parsed),
            _ => Err(invalid(
                "relay_url",
                &self.relay_url,
                "must use wss (ws is allowed only for localhost testing)".to_string(),
            )),
        }
    }

    pub fn content_debounce(&self) -> Duration {
        Duration::from_millis(self.content_debounce_ms)
    }

    pub fn tags_debounce(&self) -> Duration {
        Duration::from_millis(self.tags_debounce_ms)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|error| invalid(field, value, error.to_string()))
}

fn invalid(field: &'static str, value: &str, reason: String) -> ConfigError {
    ConfigError::InvalidUrl { field, value: value.to_string(), reason }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}
