//! Application configuration loading and validation.
//!
//! The TOML file has four tables:
//!
//! ```toml
//! [logger]     # level, console format, journald
//! [transport]  # broker session (see stacklight_mqtt::Config)
//! [monitor]    # calibration file, sample source, pacing, topics, offline queue
//! [network]    # reachability probe
//! ```
//!
//! Every table is optional and falls back to its defaults. The file is read
//! once at startup; after that the configuration is immutable.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{
    logger::LoggerConfig,
    monitor::{MonitorConfig, NetworkConfig},
};

pub mod logger;
pub mod monitor;

/// Default configuration path when neither `--config` nor `STACKLIGHT_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stacklight/config.toml";

/// Timestamp layout used by the pre-logger print macros.
#[doc(hidden)]
pub const PRINT_TIMESTAMP: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );

#[doc(hidden)]
pub fn print_line(level: console::StyledObject<&str>, args: std::fmt::Arguments<'_>) {
    let now = time::OffsetDateTime::now_utc()
        .format(PRINT_TIMESTAMP)
        .unwrap_or_default();
    println!("{}  {} {}", console::style(now).dim(), level, args);
}

/// Timestamped output for the startup phase, before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("INFO").green(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("WARN").yellow(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("ERROR").red(), format_args!($($arg)*))
    };
}

/// Errors raised while loading the application config or the calibration profile.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A required calibration item is absent. Carries the item name.
    #[error("Calibration incomplete: {0}")]
    MissingCalibration(String),

    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),
}

impl ConfigError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::IoError {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub transport: TransportConfig,

    #[validate(nested)]
    pub monitor: MonitorConfig,

    #[validate(nested)]
    pub network: NetworkConfig,
}

pub type TransportConfig = stacklight_mqtt::Config;

impl Config {
    /// Reads, parses and validates the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let raw = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let config = Self::from_toml(&raw)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml(raw: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.logger.level, "info");
        assert_eq!(config.transport.port, 1883);
        assert_eq!(config.monitor.sample_interval_ms, 100);
        assert_eq!(config.network.interval_secs, 30);
    }

    #[test]
    fn test_full_file() {
        let config = Config::from_toml(
            r#"
            [logger]
            level = "debug"

            [transport]
            host = "192.168.20.163"
            username = "shima"
            password = "shima"

            [monitor]
            calibration_path = "/tmp/calibrazione.json"
            queue_path = "/tmp/queue.jsonl"
            sample_interval_ms = 250
            trigger_payload = "machine_id"

            [network]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.transport.host, "192.168.20.163");
        assert_eq!(config.monitor.sample_interval_ms, 250);
        assert!(!config.network.enabled);
    }

    #[test]
    fn test_invalid_nested_value_is_reported() {
        let err = Config::from_toml(
            r#"
            [monitor]
            sample_interval_ms = 0
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert!(err.to_string().contains("sample_interval_ms"));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let err = Config::from_toml("[monitor\nfoo = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nhost = \"broker.local\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.transport.host, "broker.local");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/stacklight.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }

    #[test]
    fn test_deploy_sample_is_valid() {
        let config = Config::from_toml(include_str!("../../deploy/config.toml")).unwrap();
        assert_eq!(config.transport.keep_alive, 30);
        assert_eq!(config.monitor.sample_source, "/run/stacklight/sensor.fifo");
    }

    #[test]
    fn test_deploy_samples_probe_a_served_port() {
        let config = Config::from_toml(include_str!("../../deploy/config.toml")).unwrap();
        let profile = crate::core::calibration::CalibrationProfile::from_json(include_str!(
            "../../deploy/calibrazione.json"
        ))
        .unwrap();

        let (host, port) = config.network.probe_target(
            profile.probe_host.as_deref(),
            &config.transport.host,
            config.transport.port,
        );
        assert_eq!(host, "8.8.8.8");
        assert_eq!(port, 53);
        assert_ne!(port, config.transport.port);
    }
}
