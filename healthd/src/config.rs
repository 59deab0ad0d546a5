//! Daemon configuration
//!
//! Service-level settings for the health daemon: sampling interval, the
//! platform metric-configuration override path, logging, the metrics
//! endpoint and unit activation. Loaded from a TOML file with defaults
//! for every field; the JSON metric-configuration document is handled
//! separately by [`crate::metric_config`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default location of the daemon settings file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bmc-healthd/config.toml";

/// Main configuration structure for the health daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sampling loop configuration
    #[serde(default)]
    pub monitor: MonitorSection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,

    /// Metrics endpoint configuration
    #[serde(default)]
    pub metrics: MetricsSection,

    /// BMC inventory association configuration
    #[serde(default)]
    pub inventory: InventorySection,

    /// Recovery unit activation configuration
    #[serde(default)]
    pub activation: ActivationSection,
}

/// Sampling loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    /// Seconds between sampling ticks
    pub interval_secs: u64,

    /// Platform metric-configuration override; None uses the built-in
    /// default path
    pub health_config: Option<PathBuf>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            health_config: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level filter
    pub level: String,

    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Metrics endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    /// Enable the HTTP read surface
    pub enabled: bool,

    /// Bind address
    pub bind_address: String,

    /// Port; 0 disables the endpoint
    pub port: u16,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

/// BMC inventory association settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventorySection {
    /// Inventory object paths the metrics measure; empty uses the
    /// default BMC path
    pub bmc_paths: Vec<String>,
}

/// Recovery unit activation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationSection {
    /// When false, unit start requests are logged and dropped
    pub enabled: bool,
}

impl Default for ActivationSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: MonitorConfig =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from the default path if present, otherwise built-in defaults.
    pub fn load_default() -> ConfigResult<Self> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                reason: "monitor.interval_secs must be >= 1".to_string(),
            });
        }
        if self.metrics.enabled && self.metrics.port > 0 {
            if self.metrics.bind_address.is_empty() {
                return Err(ConfigError::InvalidSetting {
                    reason: "metrics.bind_address must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}
