//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RIVET_CONFIG)
//! 3. Environment variables

use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Telemetry configuration.
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RIVET_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.telemetry.apply_env_overrides();
    }

    /// Builds the listener settings.
    pub fn server_config(&self) -> ServerConfig {
        let config = ServerConfig::new(self.network.bind_addr)
            .with_stop_timeout(self.network.stop_timeout());
        match self.network.max_concurrency {
            Some(limit) => config.with_max_concurrency(limit),
            None => config,
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum connections served at once (unbounded when absent or zero).
    #[serde(deserialize_with = "deserialize_concurrency")]
    pub max_concurrency: Option<usize>,
    /// Seconds in-flight connections get to finish on shutdown.
    pub stop_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
            max_concurrency: None,
            stop_timeout_secs: 10,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RIVET_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("RIVET_MAX_CONCURRENCY") {
            if let Ok(n) = max.parse::<usize>() {
                self.max_concurrency = (n > 0).then_some(n);
            }
        }

        if let Ok(timeout) = std::env::var("RIVET_STOP_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.stop_timeout_secs = secs;
            }
        }
    }

    /// Returns the stop timeout as Duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

fn deserialize_concurrency<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let limit = Option::<usize>::deserialize(deserializer)?;
    Ok(limit.filter(|&n| n > 0))
}

/// Telemetry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log every server span through the logging observer.
    pub log_spans: bool,
}

impl TelemetryConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("RIVET_LOG_SPANS") {
            self.log_spans = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),
}

/// Serializes SocketAddr as a string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
