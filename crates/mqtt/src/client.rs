//! Construction of the rumqttc client and event loop.
//!
//! `ClientBuilder` turns a validated [`Config`] into the `AsyncClient` /
//! `EventLoop` pair. The client is cheap to clone and is used to enqueue
//! requests; the event loop must be driven by exactly one task (the
//! connection kernel).
//!
//! ```
//! use stacklight_mqtt::{ClientBuilder, Config};
//!
//! let config = Config {
//!     host: "broker.local".into(),
//!     client_id: "press-07".into(),
//!     ..Default::default()
//! };
//! let (_client, _event_loop) = ClientBuilder::from_config(&config)
//!     .unwrap()
//!     .build();
//! ```

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use tracing::debug;
use validator::Validate;

use super::{config::Config, error::TransferError};

/// Fluent builder over `MqttOptions`.
pub struct ClientBuilder {
    opts: MqttOptions,
    /// Request channel capacity.
    cap: usize,
}

impl ClientBuilder {
    /// Plain TCP client with rumqttc defaults.
    ///
    /// An empty `client_id` is replaced with a random UUID.
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        let client_id = client_id.into();
        let client_id = if client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            client_id
        };

        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap: cap.max(1),
        }
    }

    /// Validates `config` and applies every session option it carries.
    ///
    /// # Errors
    ///
    /// `TransferError::ConfigError` if the configuration fails validation.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let mut builder = Self::new(
            config.client_id.clone(),
            config.host.clone(),
            config.port,
            config.request_channel_capacity,
        )
        .keep_alive(config.keep_alive)
        .clean_session(config.clean_session)
        .max_inflight(config.max_inflight);

        if let Some(size) = config.max_packet_size {
            builder = builder.max_packet_size(size as usize, size as usize);
        }

        if let Some((user, pass)) = config.credentials() {
            debug!("Using broker credentials for user '{}'", user);
            builder = builder.credentials(user, pass);
        }

        Ok(builder)
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs.max(5)));
        self
    }

    pub fn max_packet_size(mut self, incoming: usize, outgoing: usize) -> Self {
        self.opts.set_max_packet_size(incoming, outgoing);
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    /// Client id that will be sent in CONNECT.
    pub fn client_id(&self) -> String {
        self.opts.client_id()
    }

    /// Creates the client and its event loop. Nothing touches the network
    /// until the event loop is polled.
    pub fn build(self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.opts, self.cap)
    }
}
