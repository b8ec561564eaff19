use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CLUSTER_TELEMETRY_CONFIG";
/// Env var overriding `server_url` from whatever file was loaded.
pub const SERVER_URL_ENV: &str = "CLUSTER_TELEMETRY_SERVER";

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/api/v1/";

// ── config types ──────────────────────────────────────────────────────────────

/// Retry policy for namespace connections and log streams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failures before a namespace is reported as failed.
    pub max_attempts: u32,
    /// Delay, in milliseconds, before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for the delay between retries.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

/// Terminal dimensions sent in an exec session's initial `resize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Everything the client needs to reach the cluster-watch service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL; endpoint paths are joined onto it.
    pub server_url: Url,
    pub connect_timeout_ms: u64,
    pub exec_open_timeout_ms: u64,
    /// How long a stopping worker may take before it is aborted.
    pub shutdown_grace_ms: u64,
    pub retry: RetryConfig,
    pub terminal: TerminalSize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: Url::parse(DEFAULT_SERVER_URL).expect("default server url is valid"),
            connect_timeout_ms: 5_000,
            exec_open_timeout_ms: 10_000,
            shutdown_grace_ms: 2_000,
            retry: RetryConfig::default(),
            terminal: TerminalSize::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn exec_open_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_open_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Loads the config the way the client is normally started.
    ///
    /// Resolution order:
    /// 1. The file named by `CLUSTER_TELEMETRY_CONFIG`, which must exist.
    /// 2. `<config dir>/cluster-telemetry/config.yaml`, if present.
    /// 3. Built-in defaults.
    ///
    /// `CLUSTER_TELEMETRY_SERVER` then overrides `server_url`.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
        log::info!("config: {CONFIG_PATH_ENV} = {:?}", explicit);

        let mut config = if !explicit.is_empty() {
            Self::from_file(Path::new(&explicit))?
        } else {
            match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                Some(path) => {
                    log::info!("config: skip (not found) — {}", path.display());
                    Self::default()
                }
                None => {
                    log::warn!("config: cannot determine config directory, using defaults");
                    Self::default()
                }
            }
        };

        if let Ok(server) = std::env::var(SERVER_URL_ENV) {
            if !server.is_empty() {
                config.server_url =
                    Url::parse(&server).map_err(|e| ConfigError::ServerUrl(server.clone(), e))?;
                log::info!("config: server url overridden by {SERVER_URL_ENV}");
            }
        }

        Ok(config)
    }

    /// Parses a YAML config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        log::info!("config: ok — {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}

/// `<config dir>/cluster-telemetry/config.yaml`, e.g. `~/.config/...` on Linux.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cluster-telemetry").join("config.yaml"))
}
