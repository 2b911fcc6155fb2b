//! Non-blocking QoS 1 publishing.
//!
//! `Publisher::publish` never waits on the network: it refuses immediately
//! when the session is not connected and otherwise hands the packet to the
//! client's bounded request channel with `try_publish`. Once accepted, the
//! event loop owns the packet and retransmits it until PUBACK, including
//! across reconnects when the session is persistent (`clean_session = false`).
//!
//! Accepted packets are counted in [`Unacked`] until the connection kernel
//! sees their PUBACK, so callers can wait for the broker to hold everything
//! they handed over.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, QoS};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::error::TransferError;

/// Number of QoS 1 publishes accepted by the client and not yet acknowledged
/// by the broker. Shared by the publishers and the connection kernel.
#[derive(Debug, Clone)]
pub struct Unacked {
    tx: Arc<watch::Sender<usize>>,
}

impl Default for Unacked {
    fn default() -> Self {
        Self::new()
    }
}

impl Unacked {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn count(&self) -> usize {
        *self.tx.borrow()
    }

    pub(crate) fn accepted(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    /// One PUBACK. Acknowledgements for packets this counter never saw, such
    /// as retransmissions from a previous process, are ignored.
    pub(crate) fn acknowledged(&self) {
        self.tx.send_if_modified(|n| {
            if *n == 0 {
                false
            } else {
                *n -= 1;
                true
            }
        });
    }

    /// Waits until every accepted publish is acknowledged.
    ///
    /// Returns `false` if that does not happen within `within`.
    pub async fn settled(&self, within: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let settled = matches!(
            tokio::time::timeout(within, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        settled
    }
}

#[derive(Clone)]
pub struct Publisher {
    client: AsyncClient,
    is_connected: Arc<AtomicBool>,
    unacked: Unacked,
    qos: QoS,
}

impl Publisher {
    pub fn new(client: AsyncClient, is_connected: Arc<AtomicBool>, unacked: Unacked) -> Self {
        Self {
            client,
            is_connected,
            unacked,
            qos: QoS::AtLeastOnce,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    /// Waits up to `within` for the broker to acknowledge every publish
    /// accepted so far.
    pub async fn wait_acknowledged(&self, within: Duration) -> bool {
        let settled = self.unacked.settled(within).await;
        if !settled {
            trace!("{} publish(es) still unacknowledged", self.unacked.count());
        }
        settled
    }

    /// Queues one publish for the broker.
    ///
    /// # Errors
    ///
    /// - `TransferError::NotConnected` when the session is down.
    /// - `TransferError::ClientTransfer` when the request channel is full or
    ///   the topic is invalid.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), TransferError> {
        if !self.is_connected() {
            return Err(TransferError::NotConnected);
        }

        self.client.try_publish(topic, self.qos, retain, payload)?;
        if self.qos != QoS::AtMostOnce {
            self.unacked.accepted();
        }
        debug!("Publish queued on '{}' (retain: {})", topic, retain);
        Ok(())
    }
}
