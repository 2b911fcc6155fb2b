//! # stacklight-mqtt
//!
//! Broker session layer for the stacklight monitor, built on `rumqttc`.
//!
//! The crate owns everything that touches the broker connection:
//!
//! - [`ClientBuilder`] turns a validated [`Config`] into a client/event-loop pair.
//! - [`ConnectionKernel`] drives the event loop on its own task, reconnects
//!   with bounded exponential [`Backoff`], and reports [`ConnectionState`]
//!   transitions on a watch channel. An optional [`LinkState`] watch lets a
//!   reachability probe suspend and resume the session explicitly.
//! - [`Publisher`] queues QoS 1 publishes without ever blocking the caller
//!   and can wait for their PUBACKs through [`Unacked`].
//! - [`MqttManager`] wires the above together and returns an [`MqttInstance`].
//!
//! ## Quick start
//!
//! ```ignore
//! use stacklight_mqtt::{Config, MqttManager};
//!
//! #[tokio::main]
//! async fn main() -> stacklight_mqtt::Result<()> {
//!     let instance = MqttManager::from_config(Config::default())?.build_and_start()?;
//!     let mut state = instance.state_receiver();
//!     state.wait_for(|s| s.is_connected()).await.ok();
//!
//!     instance.publisher().publish("bma/cambiostato", b"{}".to_vec(), true)?;
//!     instance.shutdown(std::time::Duration::from_millis(300)).await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod publisher;
pub mod state;

pub use backoff::{Backoff, BackoffError};
pub use client::ClientBuilder;
pub use config::Config;
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager};
pub use publisher::{Publisher, Unacked};
pub use state::{ConnectionState, LinkState};

pub type Result<T> = std::result::Result<T, TransferError>;
