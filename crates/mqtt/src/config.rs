//! Broker session configuration.
//!
//! Deserialized from the `[transport]` table of the application config and
//! validated with the `validator` crate before any socket is opened.
//!
//! ```toml
//! [transport]
//! host = "192.168.20.163"
//! port = 1883
//! username = "shima"
//! password = "shima"
//! client_id = ""            # empty: the machine id is used
//! keep_alive = 60
//! clean_session = false
//! reconnect_min_delay = 1
//! reconnect_max_delay = 30
//! reconnect_multiplier = 2.0
//! max_reconnect_attempts = 0 # unlimited
//! ```

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// MQTT session settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_backoff_window"))]
pub struct Config {
    /// Broker hostname or IP address. Resolved at connect time.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Optional broker credentials. Both must be present to be sent.
    pub username: Option<String>,
    pub password: Option<String>,

    /// MQTT client identifier.
    ///
    /// Empty means "let the application choose"; the monitor fills in its
    /// machine id, and the client builder falls back to a random UUID.
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// Keep-alive interval in seconds. rumqttc refuses values under 5.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// `false` keeps the broker-side session (and unacknowledged QoS 1
    /// publishes) across reconnects.
    pub clean_session: bool,

    /// Maximum number of unacknowledged QoS 1 publishes.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Maximum packet size in bytes, applied to both directions.
    #[validate(range(
        min = 64,
        max = 65535,
        message = "Max packet size must be between 64 and 65535 bytes"
    ))]
    pub max_packet_size: Option<u16>,

    /// Capacity of the client request channel. Publishes beyond it are
    /// rejected instead of blocking the caller.
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: usize,

    /// First reconnect pause, in seconds.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect min delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_min_delay: u64,

    /// Reconnect pause ceiling, in seconds.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Reconnect max delay must be between 1 and 3600 seconds"
    ))]
    pub reconnect_max_delay: u64,

    /// Growth factor of the reconnect pause.
    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Reconnect multiplier must be between 1.0 and 10.0"
    ))]
    pub reconnect_multiplier: f64,

    /// Attempt limit. `0` retries forever.
    pub max_reconnect_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: String::new(),
            keep_alive: 60,
            clean_session: false,
            max_inflight: 20,
            max_packet_size: Some(65_535),
            request_channel_capacity: 64,
            reconnect_min_delay: 1,
            reconnect_max_delay: 30,
            reconnect_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

impl Config {
    /// Username/password pair, when both are configured and the username is non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

fn validate_backoff_window(config: &Config) -> Result<(), ValidationError> {
    if config.reconnect_max_delay < config.reconnect_min_delay {
        let mut err = ValidationError::new("invalid_backoff_window");
        err.message = Some(
            format!(
                "reconnect_max_delay ({}) must not be lower than reconnect_min_delay ({})",
                config.reconnect_max_delay, config.reconnect_min_delay
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_empty_host_is_rejected() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keep_alive_lower_bound() {
        let config = Config {
            keep_alive: 2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Keep alive"));
    }

    #[test]
    fn test_inverted_backoff_window_is_rejected() {
        let config = Config {
            reconnect_min_delay: 30,
            reconnect_max_delay: 5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconnect_max_delay"));
    }

    #[test]
    fn test_credentials_require_both_parts() {
        let mut config = Config::default();
        assert!(config.credentials().is_none());

        config.username = Some("shima".into());
        assert!(config.credentials().is_none());

        config.password = Some("secret".into());
        assert_eq!(config.credentials(), Some(("shima", "secret")));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            host = "10.0.0.5"
            username = "shima"
            password = "shima"
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 1883);
        assert_eq!(config.reconnect_max_delay, 30);
        assert!(!config.clean_session);
    }
}
