//! Configuration management for Helios
//!
//! This module handles loading, migration and validation of the application
//! configuration from YAML files.

use crate::error::{HeliosError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults;
pub mod migrate;

/// Polling interval used when nothing is configured
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 300;

/// Hardware-protection floor; the PVS must never be polled faster than this
pub const MIN_POLLING_INTERVAL_SECS: u64 = 60;

/// Scheduler jitter tolerated by the cache-freshness check
pub const POLL_TOLERANCE_SECS: u64 = 30;

/// Sun elevation threshold (degrees) used when none is configured
pub const DEFAULT_ELEVATION_THRESHOLD: f64 = 5.0;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier for the cache file and log context; defaults to the gateway host
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Gateway connection settings
    pub gateway: GatewayConfig,

    /// Polling cadence and day/night gate
    #[serde(default)]
    pub polling: PollingConfig,

    /// Health probe retry and backoff
    #[serde(default)]
    pub health: HealthConfig,

    /// Snapshot cache location
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Status API binding
    #[serde(default)]
    pub web: WebConfig,

    /// Inverter tracking thresholds
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Site location for computing sun elevation
    #[serde(default)]
    pub location: Option<LocationConfig>,
}

/// Which wire protocol to use against the gateway
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolPreference {
    /// Detect from the firmware build at startup
    #[default]
    Auto,
    /// Unauthenticated dl_cgi query-string API
    Legacy,
    /// Session-authenticated varserver API
    Varserver,
}

/// Gateway connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// PVS address, optionally with port (e.g. "172.27.153.1" or "10.0.0.5:9090")
    pub host: String,

    /// Authentication password (last 5 characters of the PVS serial)
    #[serde(default)]
    pub credential: Option<String>,

    /// Protocol selection
    #[serde(default)]
    pub protocol: ProtocolPreference,

    /// Firmware build recorded at setup, used to detect upgrades
    #[serde(default)]
    pub firmware_build: Option<String>,
}

/// Polling cadence and day/night configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between cycles
    pub interval_seconds: u64,

    /// Master switch; when off, only cached data is served
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum sun elevation (degrees) in the morning
    pub sunrise_elevation: Option<f64>,

    /// Minimum sun elevation (degrees) in the evening
    pub sunset_elevation: Option<f64>,

    /// Single threshold from older configurations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation_threshold: Option<f64>,

    /// Interval key used by older integration releases
    #[serde(skip_serializing)]
    pub polling_interval_seconds: Option<u64>,

    /// Battery-backed systems are polled around the clock
    pub has_battery: bool,

    /// Switch to battery mode when battery devices show up in the data
    #[serde(default = "default_true")]
    pub auto_detect_battery: bool,
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Connectivity attempts per probe
    pub max_retries: u32,

    /// Cooldown after a failed probe, in seconds
    pub backoff_seconds: u64,

    /// Pause between attempts, in milliseconds
    pub retry_pause_ms: u64,

    /// TCP port probed on the gateway
    pub port: u16,
}

/// Snapshot cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding `sunpower_cache_*.json`
    pub directory: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to log file (its parent directory receives the rolling files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Web server binding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Serve the status API
    pub enabled: bool,

    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

/// Inverter health tracking thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Consecutive missed polls before an inverter alert
    pub inverter_alert_misses: u32,

    /// Missed polls after which an inverter is no longer tracked
    pub inverter_drop_misses: u32,

    /// Capacity of the response-time window
    pub response_window: usize,
}

/// Site coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("HELIOS_CONFIG") {
            return Self::from_file(path);
        }

        let default_paths = [
            "helios_config.yaml",
            "/data/helios_config.yaml",
            "/etc/helios/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Key used for the cache file and log context
    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.gateway.host.clone())
    }

    /// Configured interval, never below the hardware-protection floor
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_seconds.max(MIN_POLLING_INTERVAL_SECS))
    }

    /// Cooldown applied after an exhausted health probe
    pub const fn backoff_window(&self) -> Duration {
        Duration::from_secs(self.health.backoff_seconds)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            return Err(HeliosError::validation(
                "gateway.host",
                "Host cannot be empty",
            ));
        }

        if self.polling.interval_seconds < MIN_POLLING_INTERVAL_SECS {
            return Err(HeliosError::validation(
                "polling.interval_seconds",
                format!("Must be at least {MIN_POLLING_INTERVAL_SECS} seconds"),
            ));
        }

        for (field, value) in [
            ("polling.sunrise_elevation", self.polling.sunrise_elevation),
            ("polling.sunset_elevation", self.polling.sunset_elevation),
            ("polling.elevation_threshold", self.polling.elevation_threshold),
        ] {
            if let Some(v) = value
                && !(-90.0..=90.0).contains(&v)
            {
                return Err(HeliosError::validation(
                    field,
                    "Must be between -90 and 90 degrees",
                ));
            }
        }

        if self.health.max_retries == 0 {
            return Err(HeliosError::validation(
                "health.max_retries",
                "Must be greater than 0",
            ));
        }

        if self.diagnostics.response_window == 0 {
            return Err(HeliosError::validation(
                "diagnostics.response_window",
                "Must be greater than 0",
            ));
        }

        if self.web.enabled && self.web.port == 0 {
            return Err(HeliosError::validation(
                "web.port",
                "Port must be greater than 0",
            ));
        }

        if let Some(loc) = self.location
            && (!(-90.0..=90.0).contains(&loc.latitude)
                || !(-180.0..=180.0).contains(&loc.longitude))
        {
            return Err(HeliosError::validation(
                "location",
                "Latitude or longitude out of range",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.polling.interval_seconds, DEFAULT_POLLING_INTERVAL_SECS);
        assert_eq!(config.health.max_retries, 2);
        assert_eq!(config.health.backoff_seconds, 60);
        assert!(config.polling.enabled);
        assert!(config.polling.sunrise_elevation.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.gateway.host = String::new();
        assert!(config.validate().is_err());

        config = Config::default();
        config.polling.interval_seconds = 30;
        assert!(config.validate().is_err());

        config = Config::default();
        config.polling.sunset_elevation = Some(120.0);
        assert!(config.validate().is_err());

        config = Config::default();
        config.health.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_polling_interval_respects_floor() {
        let mut config = Config::default();
        config.polling.interval_seconds = 10;
        assert_eq!(config.polling_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_instance_id_defaults_to_host() {
        let mut config = Config::default();
        config.gateway.host = "172.27.153.1".to_string();
        assert_eq!(config.instance_id(), "172.27.153.1");
        config.instance_id = Some("garage".to_string());
        assert_eq!(config.instance_id(), "garage");
    }

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let yaml = "gateway:\n  host: 10.0.0.5\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.gateway.host, "10.0.0.5");
        assert_eq!(config.gateway.protocol, ProtocolPreference::Auto);
        assert_eq!(config.polling.interval_seconds, DEFAULT_POLLING_INTERVAL_SECS);
        assert!(config.polling.auto_detect_battery);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.gateway.host, deserialized.gateway.host);
        assert_eq!(config.health.port, deserialized.health.port);
    }
}
