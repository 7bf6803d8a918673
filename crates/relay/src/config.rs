// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Unlike lookups elsewhere, every value here is validated:
// a bad value aborts startup with an error naming the variable.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const MIN_PORT: u16 = 1024;
pub const MAX_AUTH_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnv {
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid port (expected {MIN_PORT}-65535)")]
    InvalidPort { var: &'static str, value: String },
    #[error("{var}={value:?} is not a valid IP address")]
    InvalidHost { var: &'static str, value: String },
    #[error("NOTESYNC_RELAY_PORT and NOTESYNC_RELAY_HEALTH_PORT must differ (both {0})")]
    PortCollision(u16),
    #[error("{var}={value:?} must be an absolute http(s) URL with a host")]
    InvalidBackendUrl { var: &'static str, value: String },
    #[error("{var}={value:?} is not one of {expected}")]
    InvalidChoice { var: &'static str, value: String, expected: &'static str },
    #[error("{var}={value:?} must be a positive integer")]
    InvalidNumber { var: &'static str, value: String },
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket listen address.
    pub listen_addr: SocketAddr,
    /// Health/readiness/metrics listen address.
    pub health_addr: SocketAddr,
    /// Base URL of the notes store that answers access checks.
    pub backend_url: Url,
    pub environment: RelayEnv,
    /// Log filter directive (e.g. `info`, `notesync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// How long a drain waits for sessions to close before forcing them.
    pub shutdown_timeout: Duration,
    /// Per-attempt timeout of the access check call.
    pub auth_timeout: Duration,
    /// Extra attempts after a transient access check failure.
    pub auth_retries: u32,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `NOTESYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `NOTESYNC_RELAY_PORT` | `1234` |
    /// | `NOTESYNC_RELAY_HEALTH_PORT` | `9090` |
    /// | `NOTESYNC_BACKEND_URL` | `http://localhost:8080` |
    /// | `NOTESYNC_RELAY_ENV` | `development` |
    /// | `NOTESYNC_RELAY_LOG_FILTER` | `info` |
    /// | `NOTESYNC_RELAY_LOG_FORMAT` | `text` |
    /// | `NOTESYNC_RELAY_SHUTDOWN_TIMEOUT_MS` | `30000` |
    /// | `NOTESYNC_RELAY_AUTH_TIMEOUT_MS` | `5000` |
    /// | `NOTESYNC_RELAY_AUTH_RETRIES` | `2` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host_raw = env("NOTESYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let host: IpAddr = host_raw.trim().parse().map_err(|_| ConfigError::InvalidHost {
            var: "NOTESYNC_RELAY_HOST",
            value: host_raw.clone(),
        })?;

        let port = parse_port(&env, "NOTESYNC_RELAY_PORT", 1234)?;
        let health_port = parse_port(&env, "NOTESYNC_RELAY_HEALTH_PORT", 9090)?;
        if port == health_port {
            return Err(ConfigError::PortCollision(port));
        }

        let backend_raw =
            env("NOTESYNC_BACKEND_URL").unwrap_or_else(|_| "http://localhost:8080".into());
        let backend_url = parse_backend_url(&backend_raw)?;

        let environment = match env("NOTESYNC_RELAY_ENV").as_deref().map(str::trim) {
            Err(_) | Ok("development") | Ok("dev") => RelayEnv::Development,
            Ok("production") | Ok("prod") => RelayEnv::Production,
            Ok(other) => {
                return Err(ConfigError::InvalidChoice {
                    var: "NOTESYNC_RELAY_ENV",
                    value: other.to_string(),
                    expected: "development, production",
                })
            }
        };

        let log_filter = env("NOTESYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("NOTESYNC_RELAY_LOG_FORMAT").as_deref().map(str::trim) {
            Err(_) | Ok("text") => LogFormat::Text,
            Ok("json") => LogFormat::Json,
            Ok(other) => {
                return Err(ConfigError::InvalidChoice {
                    var: "NOTESYNC_RELAY_LOG_FORMAT",
                    value: other.to_string(),
                    expected: "text, json",
                })
            }
        };

        let shutdown_timeout =
            Duration::from_millis(parse_positive(&env, "NOTESYNC_RELAY_SHUTDOWN_TIMEOUT_MS", 30_000)?);
        let auth_timeout =
            Duration::from_millis(parse_positive(&env, "NOTESYNC_RELAY_AUTH_TIMEOUT_MS", 5_000)?);

        let auth_retries = match env("NOTESYNC_RELAY_AUTH_RETRIES") {
            Err(_) => 2,
            Ok(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n <= MAX_AUTH_RETRIES)
                .ok_or(ConfigError::InvalidNumber { var: "NOTESYNC_RELAY_AUTH_RETRIES", value: raw })?,
        };

        Ok(Self {
            listen_addr: SocketAddr::new(host, port),
            health_addr: SocketAddr::new(host, health_port),
            backend_url,
            environment,
            log_filter,
            log_format,
            shutdown_timeout,
            auth_timeout,
            auth_retries,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == RelayEnv::Production
    }
}

fn parse_port<F>(env: &F, var: &'static str, default: u16) -> Result<u16, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let Ok(raw) = env(var) else {
        return Ok(default);
    };
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port >= MIN_PORT)
        .ok_or(ConfigError::InvalidPort { var, value: raw })
}

fn parse_positive<F>(env: &F, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let Ok(raw) = env(var) else {
        return Ok(default);
    };
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|value| *value > 0)
        .ok_or(ConfigError::InvalidNumber { var, value: raw })
}

fn parse_backend_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid =
        || ConfigError::InvalidBackendUrl { var: "NOTESYNC_BACKEND_URL", value: raw.to_string() };
    let url = Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url)
}
