//! Connection kernel: the task that owns the rumqttc event loop.
//!
//! ```text
//! Publisher (try_publish on AsyncClient)
//!     |
//! ConnectionKernel  <-- LinkState watch (reachability probe)
//!     |  \--> ConnectionState watch + connected flag
//! rumqttc EventLoop
//!     |
//! TCP
//! ```
//!
//! The kernel polls the event loop, tracks CONNACK/DISCONNECT, sleeps on a
//! bounded exponential backoff after errors and reports every transition on a
//! watch channel. When a link watch is attached, a `Down` report makes the
//! kernel drop the socket and stop polling (state `Suspended`); the next `Up`
//! report resumes polling, which reconnects immediately.
//!
//! Errors never terminate the kernel unless a finite attempt limit is
//! configured. Errors that retrying cannot fix (refused credentials, protocol
//! mismatch) are logged at error level and retried at the backoff ceiling.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    backoff::Backoff,
    error::TransferError,
    publisher::Unacked,
    state::{ConnectionState, LinkState},
};

/// Upper bound on flushing the DISCONNECT packet at shutdown.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(300);

/// Drives one broker session for the lifetime of the process.
pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,

    /// Mirrors `state == Connected`; read lock-free by publishers.
    is_connected: Arc<AtomicBool>,

    /// Decremented on every PUBACK.
    unacked: Unacked,

    backoff: Backoff,

    cancel: CancellationToken,

    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,

    /// Reachability reports. `None` when no probe is attached or the probe
    /// has gone away.
    link: Option<watch::Receiver<LinkState>>,
}

impl ConnectionKernel {
    pub fn new(client: AsyncClient, event_loop: EventLoop, cancel: CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            event_loop,
            is_connected: Arc::new(AtomicBool::new(false)),
            unacked: Unacked::new(),
            backoff: Backoff::default(),
            cancel,
            state_tx,
            state_rx,
            link: None,
        }
    }

    /// Replaces the default reconnect schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Attaches a reachability watch that can suspend and resume the session.
    pub fn with_link(mut self, link: watch::Receiver<LinkState>) -> Self {
        self.link = Some(link);
        self
    }

    /// Receiver that observes every state transition. The current state is
    /// visible immediately.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Shared connected flag.
    pub fn is_connected(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_connected)
    }

    /// Publish accounting shared with publishers of this session.
    pub fn unacked(&self) -> Unacked {
        self.unacked.clone()
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            info!("Connection state changed to: {}", state);
        }
    }

    fn set_connected(&self, connected: bool) {
        self.is_connected.store(connected, Ordering::Release);
    }

    fn link_is_down(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|rx| !rx.borrow().is_up())
    }

    /// Runs until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Only `TransferError::RetriesPolicy`, when a finite attempt limit is
    /// configured and used up.
    pub async fn run(&mut self) -> Result<(), TransferError> {
        self.update_state(ConnectionState::Connecting);
        self.backoff.reset();

        info!("Starting connection event loop...");
        loop {
            if self.link_is_down() && !self.suspend().await {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,

                link = next_link_state(&mut self.link) => match link {
                    Some(LinkState::Down) => {
                        warn!("Network link reported down, suspending broker session");
                    }
                    Some(LinkState::Up) => {}
                    None => {
                        debug!("Reachability probe detached");
                        self.link = None;
                    }
                },

                event = self.event_loop.poll() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        if !self.handle_error(e).await? {
                            break;
                        }
                    }
                },
            }
        }

        info!("Shutdown signal received, closing broker session...");
        self.disconnect().await;
        info!("Connection kernel shutdown completed");
        Ok(())
    }

    /// Reacts to a poll error. Returns `Ok(false)` if cancelled while waiting.
    async fn handle_error(&mut self, e: ConnectionError) -> Result<bool, TransferError> {
        let was_connected = self.is_connected.swap(false, Ordering::AcqRel);
        let reason = get_error_message(&e);
        if was_connected {
            warn!("Broker session lost: {}", reason);
        }
        self.update_state(ConnectionState::Disconnected(reason.clone()));

        let sleep = if is_fatal_error(&e) {
            error!(
                "Broker rejected the session ({}), retrying in {:.0} seconds",
                reason,
                self.backoff.max_delay().as_secs_f64()
            );
            self.backoff.max_delay()
        } else {
            match self.backoff.next_sleep() {
                Ok(sleep) => {
                    warn!(
                        "Reconnecting in {:.2} seconds due to error: {}",
                        sleep.as_secs_f64(),
                        reason
                    );
                    sleep
                }
                Err(backoff_err) => {
                    error!("Maximum retry attempts exceeded: {}", backoff_err);
                    self.update_state(ConnectionState::Disconnected(backoff_err.to_string()));
                    return Err(TransferError::RetriesPolicy(backoff_err));
                }
            }
        };

        self.update_state(ConnectionState::Reconnecting(sleep.as_secs_f64()));
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(false),
            _ = tokio::time::sleep(sleep) => {}
        }
        self.update_state(ConnectionState::Connecting);
        Ok(true)
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connection established successfully");
                    self.set_connected(true);
                    self.backoff.reset();
                    self.update_state(ConnectionState::Connected);
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.set_connected(false);
                self.update_state(ConnectionState::Disconnected(
                    "Disconnected by broker".into(),
                ));
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                trace!("PUBACK for packet {}", ack.pkid);
                self.unacked.acknowledged();
            }
            Event::Incoming(_) => {}
            Event::Outgoing(outgoing) => {
                trace!("Outgoing packet: {:?}", outgoing);
            }
        }
    }

    /// Drops the socket and waits for the link to come back.
    ///
    /// Unacknowledged publishes stay in the event loop and are retransmitted
    /// after the next CONNACK. Returns `false` if cancelled while suspended.
    async fn suspend(&mut self) -> bool {
        self.set_connected(false);
        self.event_loop.clean();
        self.update_state(ConnectionState::Suspended);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                link = next_link_state(&mut self.link) => match link {
                    Some(LinkState::Up) => {
                        info!("Network link restored, reconnecting to broker");
                        break;
                    }
                    Some(LinkState::Down) => continue,
                    None => {
                        debug!("Reachability probe detached while suspended, resuming");
                        self.link = None;
                        break;
                    }
                },
            }
        }

        self.backoff.reset();
        self.update_state(ConnectionState::Connecting);
        true
    }

    /// Best-effort DISCONNECT. Does not wait for in-flight acknowledgements.
    async fn disconnect(&mut self) {
        let was_connected = self.is_connected.swap(false, Ordering::AcqRel);
        self.update_state(ConnectionState::Disconnected("Shutdown".into()));
        if !was_connected {
            return;
        }

        if let Err(e) = self.client.try_disconnect() {
            warn!("Error queueing disconnect packet: {}", e);
            return;
        }

        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
            debug!("Disconnect packet not flushed within {:?}", DISCONNECT_FLUSH);
        }
    }
}

/// Next reachability report; never resolves when no probe is attached.
async fn next_link_state(link: &mut Option<watch::Receiver<LinkState>>) -> Option<LinkState> {
    match link {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Retrying at the normal pace cannot help.
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::MqttState(_) => Reconnect,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost message of an error chain, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::io;

    use tracing_test::traced_test;

    use rumqttc::PubAck;

    use super::*;
    use crate::{client::ClientBuilder, config::Config};

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "kernel-test".to_string(),
            ..Default::default()
        }
    }

    fn test_kernel(cancel: CancellationToken) -> ConnectionKernel {
        let (client, event_loop) = ClientBuilder::from_config(&test_config()).unwrap().build();
        ConnectionKernel::new(client, event_loop, cancel)
    }

    #[tokio::test]
    async fn test_puback_settles_accepted_publish() {
        let mut kernel = test_kernel(CancellationToken::new());
        let unacked = kernel.unacked();
        unacked.accepted();
        assert_eq!(unacked.count(), 1);

        kernel.handle_event(Event::Incoming(Packet::PubAck(PubAck::new(1))));
        assert_eq!(unacked.count(), 0);
        assert!(unacked.settled(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_state_subscription_sees_updates() {
        let kernel = test_kernel(CancellationToken::new());
        let mut state_rx = kernel.subscribe_state();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);

        kernel.update_state(ConnectionState::Connected);

        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_identical_state_is_not_rebroadcast() {
        let kernel = test_kernel(CancellationToken::new());
        let mut state_rx = kernel.subscribe_state();
        state_rx.borrow_and_update();

        kernel.update_state(ConnectionState::Connecting);
        assert!(!state_rx.has_changed().unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_kernel_suspends_while_link_down_and_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let (link_tx, link_rx) = watch::channel(LinkState::Down);
        let mut kernel = test_kernel(cancel.clone()).with_link(link_rx);
        let mut state_rx = kernel.subscribe_state();
        let connected = kernel.is_connected();

        let handle = tokio::spawn(async move { kernel.run().await });

        let suspended = tokio::time::timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|s| *s == ConnectionState::Suspended),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(suspended);
        assert!(!connected.load(Ordering::Acquire));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(logs_contain("Connection kernel shutdown completed"));
        drop(link_tx);
    }

    #[test]
    fn test_fatal_error_detection() {
        let refused = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_fatal_error(&refused));

        let permission = ConnectionError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "permission denied",
        ));
        assert!(is_fatal_error(&permission));

        assert!(is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )));
        assert!(!is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable
        )));
        assert!(!is_fatal_error(&ConnectionError::NetworkTimeout));
    }

    #[test]
    fn test_error_message_unwraps_source_chain() {
        let err = ConnectionError::Io(io::Error::new(io::ErrorKind::Other, "\"boom\""));
        assert_eq!(get_error_message(&err), "boom");
    }
}
