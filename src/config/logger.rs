//! `[logger]` table: global level and output targets.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Timestamp of each console log line, in local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    #[default]
    Rfc3339,
    /// Seconds since the epoch, with milliseconds.
    Unix,
    /// A `time` format description, e.g. `"[hour]:[minute]:[second]"`.
    Custom(String),
}

/// Console line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// trace, debug, info, warn or error (case-insensitive). `RUST_LOG` wins when set.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,

    #[validate(custom(function = "validate_timestamp_format"))]
    pub timestamp_format: TimestampFormat,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            console: Some(ConsoleConfig::default()),
            journald: None,
            timestamp_format: TimestampFormat::default(),
        }
    }
}

impl LoggerConfig {
    /// Copy of this configuration with the level forced to `debug`.
    ///
    /// A more verbose configured level (`trace`) is kept.
    pub fn with_debug(&self) -> Self {
        let mut config = self.clone();
        if !config.level.eq_ignore_ascii_case("trace") {
            config.level = "debug".to_string();
        }
        config
    }
}

fn validate_timestamp_format(format: &TimestampFormat) -> Result<(), ValidationError> {
    let TimestampFormat::Custom(description) = format else {
        return Ok(());
    };
    if let Err(e) = time::format_description::parse_owned::<2>(description) {
        let mut err = ValidationError::new("invalid_timestamp_format");
        err.message = Some(format!("Invalid timestamp format '{}': {}", description, e).into());
        return Err(err);
    }
    Ok(())
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,
    /// Print the module path of each event.
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            ansi_colors: true,
        }
    }
}

/// systemd journal output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    pub enabled: bool,

    /// `SYSLOG_IDENTIFIER` of every entry.
    #[validate(length(min = 1, message = "journald identifier must not be empty"))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "stacklight".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_validation() {
        assert!(validate_log_level("INFO").is_ok());
        assert!(validate_log_level("verbose").is_err());

        let config = LoggerConfig {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_debug_raises_level() {
        let config = LoggerConfig::default().with_debug();
        assert_eq!(config.level, "debug");

        let trace = LoggerConfig {
            level: "trace".into(),
            ..Default::default()
        };
        assert_eq!(trace.with_debug().level, "trace");
    }

    #[test]
    fn test_timestamp_format_spelling_and_validation() {
        let config: LoggerConfig = toml::from_str(r#"timestamp_format = "unix""#).unwrap();
        assert_eq!(config.timestamp_format, TimestampFormat::Unix);

        let config: LoggerConfig =
            toml::from_str(r#"timestamp_format = { custom = "[hour]:[minute]:[second]" }"#).unwrap();
        assert!(config.validate().is_ok());

        let config = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_journald_identifier_is_rejected() {
        let config = LoggerConfig {
            journald: Some(JournaldConfig {
                enabled: true,
                identifier: String::new(),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
