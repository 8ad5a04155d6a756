//! # Meter Configuration
//!
//! `MeterConfig` collects everything needed to talk to one meter: the serial
//! link settings, the meter model and the polling schedule. It is usually
//! loaded from a JSON file; every field has a default, so `{}` is a valid
//! configuration.
//!
//! ```json
//! {
//!     "port": "/dev/ttyUSB0",
//!     "model": "382",
//!     "scan_interval_secs": 30
//! }
//! ```

use crate::constants::{
    DEFAULT_BAUDRATE, DEFAULT_FAILURE_THRESHOLD, DEFAULT_MAX_BACKOFF_SECS,
    DEFAULT_SCAN_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS,
};
use crate::coordinator::CoordinatorConfig;
use crate::error::ConfigError;
use crate::kmp::serial::SerialConfig;
use crate::payload::MeterModel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_stop_bits() -> u8 {
    1
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_max_backoff() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}

/// Settings for one meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    /// Serial device path
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    #[serde(default)]
    pub model: MeterModel,

    /// Delay between polls
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Time allowed for one request/response exchange
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,

    /// Fully-failed polls in a row before backing off
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Upper bound on the backoff delay
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        MeterConfig {
            port: default_port(),
            baudrate: default_baudrate(),
            stop_bits: default_stop_bits(),
            model: MeterModel::default(),
            scan_interval_secs: default_scan_interval(),
            timeout_secs: default_timeout(),
            failure_threshold: default_failure_threshold(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl MeterConfig {
    /// Loads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: MeterConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.port.trim().is_empty() {
            return invalid("port must not be empty".into());
        }
        if self.baudrate == 0 {
            return invalid("baudrate must be positive".into());
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return invalid(format!("stop_bits must be 1 or 2, got {}", self.stop_bits));
        }
        if self.scan_interval_secs == 0 {
            return invalid("scan_interval_secs must be positive".into());
        }
        if self.timeout_secs <= 0.0 || Duration::try_from_secs_f64(self.timeout_secs).is_err() {
            return invalid(format!(
                "timeout_secs must be a positive number of seconds, got {}",
                self.timeout_secs
            ));
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be positive".into());
        }
        if self.max_backoff_secs < self.scan_interval_secs {
            return invalid(format!(
                "max_backoff_secs ({}) is below scan_interval_secs ({})",
                self.max_backoff_secs, self.scan_interval_secs
            ));
        }
        Ok(())
    }

    /// Exchange timeout. A value that `validate` would reject falls back to
    /// the default.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or_else(|| {
                log::warn!(
                    "Invalid timeout_secs {}, using {DEFAULT_TIMEOUT_SECS} s",
                    self.timeout_secs
                );
                Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS)
            })
    }

    /// Serial settings for [`crate::kmp::SerialTransport`].
    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            port: self.port.clone(),
            baudrate: self.baudrate,
            stop_bits: match self.stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            },
            timeout: self.timeout(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            interval: Duration::from_secs(self.scan_interval_secs),
            timeout: self.timeout(),
            failure_threshold: self.failure_threshold,
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MeterConfig::default();
        assert_eq!(config.baudrate, 9600);
        assert_eq!(config.model, MeterModel::Kamstrup403);
        assert_eq!(config.scan_interval_secs, 60);
        assert!(config.validate().is_ok());

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator, CoordinatorConfig::default());
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: MeterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MeterConfig::default());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": "/dev/ttyAMA0", "model": "382", "stop_bits": 2, "timeout_secs": 2.5}}"#
        )
        .unwrap();

        let config = MeterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, "/dev/ttyAMA0");
        assert_eq!(config.model, MeterModel::Kamstrup382);
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert_eq!(config.serial_config().stop_bits, tokio_serial::StopBits::Two);
    }

    #[test]
    fn test_validation_errors() {
        let bad = [
            MeterConfig { baudrate: 0, ..MeterConfig::default() },
            MeterConfig { stop_bits: 3, ..MeterConfig::default() },
            MeterConfig { scan_interval_secs: 0, ..MeterConfig::default() },
            MeterConfig { timeout_secs: 0.0, ..MeterConfig::default() },
            MeterConfig { timeout_secs: f64::NAN, ..MeterConfig::default() },
            MeterConfig { timeout_secs: f64::INFINITY, ..MeterConfig::default() },
            MeterConfig { timeout_secs: 1e20, ..MeterConfig::default() },
            MeterConfig { failure_threshold: 0, ..MeterConfig::default() },
            MeterConfig { max_backoff_secs: 10, ..MeterConfig::default() },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_huge_timeout_rejected_without_panic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"timeout_secs": 1e20}}"#).unwrap();
        assert!(matches!(
            MeterConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        // Unvalidated configs still convert without panicking
        let config = MeterConfig { timeout_secs: 1e20, ..MeterConfig::default() };
        assert_eq!(config.timeout(), Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.coordinator_config().timeout, config.timeout());
        assert_eq!(config.serial_config().timeout, config.timeout());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<MeterConfig, _> = serde_json::from_str(r#"{"baud": 9600}"#);
        assert!(result.is_err());
    }
}
