//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - PollingConfig: refresh interval, per-attempt timeout, retry budget.
//!     - StalenessConfig: how old a reading may be and still report metrics.
//!     - BluetoothConfig: adapter name and which sensor backend to use.
//!     - ServerConfig: http listen address.
//!     - SensorEntry: one `[[sensors]]` table per plant (name + mac).
//!
//! ==============================================================================

use crate::domain::SensorConfig;
use crate::updater::RetryPolicy;

use chrono::TimeDelta;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// one hundred years; keeps durations clear of chrono and tokio overflow
const MAX_DURATION_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("polling.{0} must be greater than zero")]
    Zero(&'static str),
    #[error("staleness.stale_after_seconds must be greater than zero")]
    ZeroStaleness,
    #[error("{field} is out of range (max {max})")]
    OutOfRange { field: &'static str, max: u64 },
    #[error("sensor {0:?} has an empty name")]
    EmptyName(String),
    #[error("sensor {name:?} has an invalid mac address {mac:?}")]
    InvalidMac { name: String, mac: String },
    #[error("mac address {0} is configured more than once")]
    DuplicateMac(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HostConfig {
    pub polling: PollingConfig,
    pub staleness: StalenessConfig,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub attempts: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StalenessConfig {
    pub stale_after_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Gatttool,
    #[default]
    Simulated,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BluetoothConfig {
    pub adapter: String,
    #[serde(default)]
    pub backend: Backend,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SensorEntry {
    pub name: String,
    pub mac: String,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self { adapter: "hci0".to_string(), backend: Backend::default() }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_addr: "0.0.0.0:9294".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    /// Parse and validate a toml document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HostConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    ///
    /// an explicit path must load. otherwise the first well-known location
    /// that exists must load; defaults apply only when none exists.
    pub fn load_or_default(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            let config = Self::load(path)
                .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
            println!("[CONFIG] Loaded from {}", path.display());
            return Ok(config);
        }

        Self::load_first(&[
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ])
    }

    fn load_first(paths: &[PathBuf]) -> anyhow::Result<Self> {
        for path in paths {
            if path.exists() {
                let config = Self::load(path)
                    .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
                println!("[CONFIG] Loaded from {}", path.display());
                return Ok(config);
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.interval_seconds == 0 {
            return Err(ConfigError::Zero("interval_seconds"));
        }
        if self.polling.timeout_seconds == 0 {
            return Err(ConfigError::Zero("timeout_seconds"));
        }
        if self.polling.attempts == 0 {
            return Err(ConfigError::Zero("attempts"));
        }
        if self.staleness.stale_after_seconds == 0 {
            return Err(ConfigError::ZeroStaleness);
        }
        for (field, secs) in [
            ("polling.interval_seconds", self.polling.interval_seconds),
            ("polling.timeout_seconds", self.polling.timeout_seconds),
            ("staleness.stale_after_seconds", self.staleness.stale_after_seconds),
        ] {
            if secs > MAX_DURATION_SECONDS {
                return Err(ConfigError::OutOfRange { field, max: MAX_DURATION_SECONDS });
            }
        }
        if self.polling.retry_delay_ms / 1000 > MAX_DURATION_SECONDS {
            return Err(ConfigError::OutOfRange {
                field: "polling.retry_delay_ms",
                max: MAX_DURATION_SECONDS * 1000,
            });
        }

        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            if sensor.name.trim().is_empty() {
                return Err(ConfigError::EmptyName(sensor.mac.clone()));
            }
            if !is_mac_address(&sensor.mac) {
                return Err(ConfigError::InvalidMac {
                    name: sensor.name.clone(),
                    mac: sensor.mac.clone(),
                });
            }
            if !seen.insert(sensor.mac.to_ascii_uppercase()) {
                return Err(ConfigError::DuplicateMac(sensor.mac.clone()));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.polling.attempts,
            timeout: Duration::from_secs(self.polling.timeout_seconds),
            delay: Duration::from_millis(self.polling.retry_delay_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_seconds)
    }

    /// saturates instead of panicking on values `validate` would reject
    pub fn stale_after(&self) -> TimeDelta {
        i64::try_from(self.staleness.stale_after_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    /// configured sensors with normalized (upper case) mac addresses
    pub fn sensor_configs(&self) -> Vec<SensorConfig> {
        self.sensors
            .iter()
            .map(|s| SensorConfig::new(s.mac.to_ascii_uppercase(), s.name.clone()))
            .collect()
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│           HOST CONFIGURATION            │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Adapter: {} ({:?})", self.bluetooth.adapter, self.bluetooth.backend);
        println!("│ Listen: {}", self.server.listen_addr);
        println!("│ Poll Interval: {}s", self.polling.interval_seconds);
        println!(
            "│ Timeout: {}s x {} attempts",
            self.polling.timeout_seconds, self.polling.attempts
        );
        println!("│ Stale After: {}s", self.staleness.stale_after_seconds);
        println!("│ Log Level: {}", self.logging.level);
        println!("│ Sensors: {}", self.sensors.len());
        println!("└─────────────────────────────────────────┘");
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            polling: PollingConfig {
                interval_seconds: 300,
                timeout_seconds: 60,
                attempts: 3,
                retry_delay_ms: 1000,
            },
            staleness: StalenessConfig { stale_after_seconds: 3600 },
            bluetooth: BluetoothConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            sensors: Vec::new(),
        }
    }
}

fn is_mac_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}
