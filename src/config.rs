//! fleetd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main fleetd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry channel sizing and query deadline
    pub registry: RegistryConfig,

    /// Defaults for the `simulate` command
    pub simulate: SimulateConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.registry.channel_buffer == 0 {
            eyre::bail!("registry.channel-buffer must be at least 1");
        }
        if self.registry.device_channel_buffer == 0 {
            eyre::bail!("registry.device-channel-buffer must be at least 1");
        }
        if self.registry.query_timeout_ms == 0 {
            eyre::bail!("registry.query-timeout-ms must be at least 1");
        }
        if self.simulate.devices_per_group == 0 {
            eyre::bail!("simulate.devices-per-group must be at least 1");
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .fleetd.yml
        let local_config = PathBuf::from(".fleetd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/fleetd/fleetd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("fleetd").join("fleetd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Registry channel sizing and query deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Inbox buffer for the manager and each group
    #[serde(rename = "channel-buffer")]
    pub channel_buffer: usize,

    /// Inbox buffer for each device
    #[serde(rename = "device-channel-buffer")]
    pub device_channel_buffer: usize,

    /// Default aggregate-query deadline in milliseconds
    #[serde(rename = "query-timeout-ms")]
    pub query_timeout_ms: u64,
}

impl RegistryConfig {
    /// The default aggregate-query deadline as a `Duration`
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 64,
            device_channel_buffer: 16,
            query_timeout_ms: 3_000,
        }
    }
}

/// Defaults for the `simulate` command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulateConfig {
    /// Number of groups to populate
    pub groups: usize,

    /// Number of devices tracked per group
    #[serde(rename = "devices-per-group")]
    pub devices_per_group: usize,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            groups: 2,
            devices_per_group: 3,
        }
    }
}
