//! Configuration file support for the pump manager.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/insulin-pump/config.toml`.

use crate::{Error, Result, DEFAULT_RESERVOIR_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PumpConfig {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub device: DeviceConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl DataConfig {
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("pump_state.json")
    }

    pub fn pending_events_path(&self) -> PathBuf {
        self.data_dir.join("wal").join("pending_events.wal")
    }
}

/// Device behaviour configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Simulated round trip latency for each command
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,

    /// Round trips longer than this fail with a communication error
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_delivery_units_per_minute")]
    pub delivery_units_per_minute: f64,

    #[serde(default = "default_reservoir_capacity")]
    pub reservoir_capacity: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            delivery_units_per_minute: default_delivery_units_per_minute(),
            reservoir_capacity: default_reservoir_capacity(),
        }
    }
}

impl DeviceConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Reject values the executor cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.latency_ms == 0 {
            return Err(Error::Config("device.latency_ms must be non-zero".into()));
        }
        if self.command_timeout_ms <= self.latency_ms {
            return Err(Error::Config(format!(
                "device.command_timeout_ms ({}) must exceed device.latency_ms ({})",
                self.command_timeout_ms, self.latency_ms
            )));
        }
        let rate = self.delivery_units_per_minute;
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(Error::Config(
                "device.delivery_units_per_minute must be positive".into(),
            ));
        }
        if !(self.reservoir_capacity > 0.0) {
            return Err(Error::Config(
                "device.reservoir_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("insulin-pump")
}

fn default_latency_ms() -> u64 {
    250
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_delivery_units_per_minute() -> f64 {
    1.5
}

fn default_reservoir_capacity() -> f64 {
    DEFAULT_RESERVOIR_CAPACITY
}

impl PumpConfig {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PumpConfig = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        base.join("insulin-pump").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values the executor cannot work with
    pub fn validate(&self) -> Result<()> {
        self.device.validate()
    }
}
