//! Master configuration.
//!
//! Supports TOML deserialization with sensible defaults for development
//! and explicit values for production deployment. The configuration is
//! frozen once `init` returns successfully; the only field the master
//! itself rewrites is `dc_enabled`, which is downgraded when the bus turns
//! out not to be DC-capable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default bound on the execution-jitter estimate gating OP promotion.
pub const MAX_EXECUTION_JITTER_DEFAULT: Duration = Duration::from_micros(25);

/// Master configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Network interface name (e.g. "enp3s0", "eth0").
    pub interface: String,

    /// Fail `init` when any registered subdevice is missing from the bus.
    pub require_all_subdevices: bool,

    /// Do not attempt recovery of subdevices that fall back; fault the
    /// whole master instead.
    pub disable_recovery: bool,

    /// Read RX error counters from subdevices that fall back, before
    /// recovery is attempted.
    pub read_rx_error_statistics: bool,

    /// Clear the Complete-Access capability bit on every subdevice,
    /// for devices that misreport CA support.
    pub disable_complete_access: bool,

    /// Enable Distributed Clocks synchronization.
    pub dc_enabled: bool,

    /// How long `receive` waits for the cyclic frame.
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Nominal cycle time; only meaningful when DC is enabled.
    #[serde(with = "humantime_serde")]
    pub cycle_time: Duration,

    /// Execution-jitter bound gating promotion to OP.
    #[serde(with = "humantime_serde")]
    pub max_execution_jitter: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            require_all_subdevices: false,
            disable_recovery: false,
            read_rx_error_statistics: false,
            disable_complete_access: false,
            dc_enabled: false,
            receive_timeout: Duration::from_millis(2),
            cycle_time: Duration::from_millis(1),
            max_execution_jitter: MAX_EXECUTION_JITTER_DEFAULT,
        }
    }
}

impl MasterConfig {
    /// Create a configuration for the given network interface.
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Receive timeout in microseconds, as handed to the driver.
    #[must_use]
    pub fn receive_timeout_us(&self) -> u64 {
        self.receive_timeout.as_micros() as u64
    }

    /// Cycle time in nanoseconds.
    #[must_use]
    pub fn cycle_time_ns(&self) -> u64 {
        self.cycle_time.as_nanos() as u64
    }

    /// Jitter bound in nanoseconds.
    #[must_use]
    pub fn max_execution_jitter_ns(&self) -> u64 {
        self.max_execution_jitter.as_nanos() as u64
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MasterConfig::default();
        assert_eq!(config.receive_timeout, Duration::from_millis(2));
        assert_eq!(config.cycle_time, Duration::from_millis(1));
        assert_eq!(config.max_execution_jitter, Duration::from_micros(25));
        assert!(!config.dc_enabled);
        assert!(!config.require_all_subdevices);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            interface = "enp3s0"
            require_all_subdevices = true
            dc_enabled = true
            cycle_time = "500us"
            max_execution_jitter = "10us"
        "#;

        let config = MasterConfig::from_toml(toml).unwrap();
        assert_eq!(config.interface, "enp3s0");
        assert!(config.require_all_subdevices);
        assert!(config.dc_enabled);
        assert_eq!(config.cycle_time, Duration::from_micros(500));
        assert_eq!(config.max_execution_jitter_ns(), 10_000);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.receive_timeout_us(), 2_000);
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = MasterConfig::new("eth0");
        config.dc_enabled = true;
        config.cycle_time = Duration::from_millis(4);

        let toml = config.to_toml().unwrap();
        let parsed = MasterConfig::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "interface = \"eth1\"\n").unwrap();

        let config = MasterConfig::from_file(&path).unwrap();
        assert_eq!(config.interface, "eth1");

        let missing = MasterConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
