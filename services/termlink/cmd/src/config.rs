//! Configuration handling for the terminal client.
//!
//! Settings come from an optional YAML file, then `TERMLINK_*` environment
//! variables, then command-line flags (applied by `main`). The log level is
//! resolved earlier, before the subscriber is installed.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use termlink_session::EngineConfig;
use tracing::{info, warn};

/// Endpoint used when nothing else is configured
pub const DEFAULT_URL: &str = "ws://localhost:8080/ws/test-room";

/// Terminal client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket endpoint
    pub url: String,
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
    /// Connect timeout under normal conditions
    pub connect_timeout: Duration,
    /// Whether the health probe may gate reconnection
    pub health_probe: bool,
    /// Automatic retries before giving up
    pub max_retry_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            url: DEFAULT_URL.to_string(),
            heartbeat_interval: engine.heartbeat_interval,
            connect_timeout: engine.connect_timeout,
            health_probe: engine.health_probe_enabled,
            max_retry_attempts: engine.max_retry_attempts,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Deserialize)]
struct ClientSection {
    url: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    health_probe: Option<bool>,
    max_retry_attempts: Option<u32>,
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        let Some(client) = root_config.client else {
            return;
        };
        if let Some(url) = client.url {
            self.url = url;
        }
        if let Some(ms) = client.heartbeat_interval_ms {
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = client.connect_timeout_ms {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = client.health_probe {
            self.health_probe = enabled;
        }
        if let Some(attempts) = client.max_retry_attempts {
            self.max_retry_attempts = attempts;
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TERMLINK_URL") {
            info!("URL overridden by environment: {}", url);
            self.url = url;
        }

        if let Some(value) = lookup("TERMLINK_HEARTBEAT_INTERVAL") {
            match humantime::parse_duration(&value) {
                Ok(interval) => {
                    self.heartbeat_interval = interval;
                    info!("Heartbeat interval overridden by environment: {}", value);
                }
                Err(e) => warn!("Ignoring TERMLINK_HEARTBEAT_INTERVAL={}: {}", value, e),
            }
        }

        if let Some(value) = lookup("TERMLINK_CONNECT_TIMEOUT") {
            match humantime::parse_duration(&value) {
                Ok(timeout) => {
                    self.connect_timeout = timeout;
                    info!("Connect timeout overridden by environment: {}", value);
                }
                Err(e) => warn!("Ignoring TERMLINK_CONNECT_TIMEOUT={}: {}", value, e),
            }
        }

        if let Some(value) = lookup("TERMLINK_HEALTH_PROBE") {
            self.health_probe = !matches!(value.to_lowercase().as_str(), "false" | "0" | "off");
        }
    }

    /// Engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let heartbeat_interval = if self.heartbeat_interval.is_zero() {
            warn!(
                "Heartbeat interval must be non-zero, using {:?}",
                defaults.heartbeat_interval
            );
            defaults.heartbeat_interval
        } else {
            self.heartbeat_interval
        };

        EngineConfig {
            heartbeat_interval,
            connect_timeout: self.connect_timeout,
            extended_connect_timeout: self
                .connect_timeout
                .max(defaults.extended_connect_timeout),
            health_probe_enabled: self.health_probe,
            max_retry_attempts: self.max_retry_attempts,
            ..defaults
        }
    }
}
