//! Entry point that wires the client, the connection kernel and its task.
//!
//! ```ignore
//! let instance = MqttManager::from_config(config)?
//!     .with_link(link_rx)
//!     .with_cancel_token(shutdown.clone())
//!     .build_and_start()?;
//!
//! let publisher = instance.publisher();
//! let mut state_rx = instance.state_receiver();
//! ```

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use rumqttc::AsyncClient;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use validator::Validate;

use super::{
    backoff::Backoff,
    client::ClientBuilder,
    config::Config,
    connection::ConnectionKernel,
    error::TransferError,
    publisher::{Publisher, Unacked},
    state::{ConnectionState, LinkState},
};

/// Collects the pieces needed to start a broker session.
pub struct MqttManager {
    config: Config,
    link: Option<watch::Receiver<LinkState>>,
    cancel_token: CancellationToken,
}

impl MqttManager {
    /// # Errors
    ///
    /// `TransferError::ConfigError` if `config` fails validation.
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            config,
            link: None,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Lets a reachability probe suspend and resume the session.
    pub fn with_link(mut self, link: watch::Receiver<LinkState>) -> Self {
        self.link = Some(link);
        self
    }

    /// Shares the application's shutdown token with the kernel.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Builds the client and spawns the connection kernel.
    ///
    /// Returns as soon as the task is running; the session connects in the
    /// background. Must be called from within a tokio runtime.
    pub fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        let builder = ClientBuilder::from_config(&self.config)?;
        info!(
            "Building MQTT session to {}:{} as '{}'",
            self.config.host,
            self.config.port,
            builder.client_id()
        );
        let (client, event_loop) = builder.build();

        let mut kernel = ConnectionKernel::new(client.clone(), event_loop, self.cancel_token.clone())
            .with_backoff(Backoff::from_config(&self.config));
        if let Some(link) = self.link {
            kernel = kernel.with_link(link);
        }

        let state_rx = kernel.subscribe_state();
        let is_connected = kernel.is_connected();
        let unacked = kernel.unacked();

        let kernel_handle = tokio::spawn(async move {
            if let Err(e) = kernel.run().await {
                error!("MQTT connection kernel exited with error: {}", e);
            }
        });

        Ok(MqttInstance {
            client,
            state_rx,
            is_connected,
            unacked,
            cancel_token: self.cancel_token,
            kernel_handle,
        })
    }
}

/// A running broker session.
pub struct MqttInstance {
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    is_connected: Arc<AtomicBool>,
    unacked: Unacked,
    cancel_token: CancellationToken,
    kernel_handle: JoinHandle<()>,
}

impl MqttInstance {
    /// Receiver for session state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Publisher bound to this session's client and connected flag.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.client.clone(),
            Arc::clone(&self.is_connected),
            self.unacked.clone(),
        )
    }

    /// Cancels the kernel and waits up to `grace` for it to send DISCONNECT.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel_token.cancel();
        if tokio::time::timeout(grace, self.kernel_handle).await.is_err() {
            info!("MQTT kernel did not stop within {:?}, abandoning it", grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manager_rejects_invalid_config() {
        let result = MqttManager::from_config(Config {
            port: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(TransferError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_instance_shuts_down_while_link_down() {
        let (_link_tx, link_rx) = watch::channel(LinkState::Down);
        let token = CancellationToken::new();

        let instance = MqttManager::from_config(Config {
            host: "127.0.0.1".into(),
            ..Default::default()
        })
        .unwrap()
        .with_link(link_rx)
        .with_cancel_token(token.clone())
        .build_and_start()
        .unwrap();

        let publisher = instance.publisher();
        assert!(!publisher.is_connected());
        assert!(publisher.publish("a/b", b"x".to_vec(), true).is_err());

        instance.shutdown(Duration::from_secs(2)).await;
        assert!(token.is_cancelled());
    }
}
