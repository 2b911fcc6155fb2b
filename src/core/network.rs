//! Periodic reachability probe.
//!
//! The monitor publishes a [`LinkState`] on a watch channel. The connection
//! kernel subscribes to it: `Down` suspends the broker session at once instead
//! of waiting for the keep-alive to expire, `Up` resumes it.

use std::time::Duration;

use async_trait::async_trait;
use stacklight_mqtt::LinkState;
use tokio::{
    net::TcpStream,
    sync::watch,
    time::{interval, timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Probe: Send + Sync {
    /// Whether the target answered.
    async fn probe(&self) -> bool;

    /// Human-readable target, for logs.
    fn target(&self) -> String;
}

/// Reachability by TCP connect.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self) -> bool {
        match timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", self.target(), e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", self.target(), self.timeout);
                false
            }
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct NetworkMonitor<P: Probe> {
    probe: P,
    interval: Duration,
    link_tx: watch::Sender<LinkState>,
}

impl<P: Probe> NetworkMonitor<P> {
    /// The link starts as `Up` so the session tries to connect right away.
    pub fn new(probe: P, interval: Duration) -> (Self, watch::Receiver<LinkState>) {
        let (link_tx, link_rx) = watch::channel(LinkState::Up);
        (
            Self {
                probe,
                interval,
                link_tx,
            },
            link_rx,
        )
    }

    /// Probes once and publishes the result if it changed.
    pub async fn check(&self) -> LinkState {
        let state = if self.probe.probe().await {
            LinkState::Up
        } else {
            LinkState::Down
        };

        let changed = self.link_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });

        if changed {
            match state {
                LinkState::Up => info!("Network link to {} restored", self.probe.target()),
                LinkState::Down => warn!("Network link to {} lost", self.probe.target()),
            }
        }
        state
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Network monitor started (target: {}, every {:?})",
            self.probe.target(),
            self.interval
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
        debug!("Network monitor stopped");
    }
}
