//! Delivery of published-state events to the broker.
//!
//! The [`DeliveryManager`] runs on its own task and is fed by the sampling
//! loop over an unbounded channel, so the loop never waits on the network.
//!
//! For every event:
//!
//! 1. If the session is down, wait up to the reconnect grace for it to come back.
//! 2. Replay the offline queue first, so older changes keep their order.
//! 3. Publish the payload (QoS 1, retained) on the status topic and on the
//!    shared trigger topic.
//!
//! Anything that cannot be handed to the session goes to the [`OfflineQueue`].
//! The queue is also replayed on every transition to `Connected`. Replay is
//! all-or-nothing: the file is removed only after the broker acknowledged
//! every entry. A queue that cannot be read does not hold back live events.

use std::time::Duration;

use async_trait::async_trait;
use stacklight_mqtt::{ConnectionState, Publisher as MqttPublisher, TransferError};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    error::DeliveryError,
    event::PublishEvent,
    queue::OfflineQueue,
};
use crate::config::monitor::{MonitorConfig, TriggerPayload};

const CHANNEL_FULL_RETRIES: u32 = 50;
const CHANNEL_FULL_DELAY: Duration = Duration::from_millis(20);

/// Sink for retained QoS 1 publishes.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), DeliveryError>;

    /// Waits up to `within` for the broker to acknowledge everything
    /// published so far.
    async fn wait_acknowledged(&self, within: Duration) -> bool;

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl Publisher for MqttPublisher {
    /// Retries while the client's request channel is full, as long as the
    /// session stays connected.
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), DeliveryError> {
        let mut attempts = 0;
        loop {
            match MqttPublisher::publish(self, topic, payload.to_vec(), retain) {
                Err(TransferError::ClientTransfer(e))
                    if attempts < CHANNEL_FULL_RETRIES && MqttPublisher::is_connected(self) =>
                {
                    attempts += 1;
                    trace!("Request channel busy ({}), retry {}", e, attempts);
                    sleep(CHANNEL_FULL_DELAY).await;
                }
                result => return result.map_err(DeliveryError::from),
            }
        }
    }

    async fn wait_acknowledged(&self, within: Duration) -> bool {
        MqttPublisher::wait_acknowledged(self, within).await
    }

    fn is_connected(&self) -> bool {
        MqttPublisher::is_connected(self)
    }
}

/// Outcome of replaying the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// The queue is empty, or was delivered and removed.
    Drained,
    /// Some entry was not delivered or acknowledged; the file is kept.
    Kept,
    /// The queue could not be read.
    Unreadable,
}

/// Topic layout of the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    status_template: String,
    trigger: String,
    trigger_payload: TriggerPayload,
}

impl Topics {
    pub fn new(
        status_template: impl Into<String>,
        trigger: impl Into<String>,
        trigger_payload: TriggerPayload,
    ) -> Self {
        Self {
            status_template: status_template.into(),
            trigger: trigger.into(),
            trigger_payload,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            config.status_topic.clone(),
            config.trigger_topic.clone(),
            config.trigger_payload,
        )
    }

    /// Status topic of `machine_id`.
    pub fn status(&self, machine_id: &str) -> String {
        self.status_template.replace("{machine_id}", machine_id)
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    fn trigger_body(&self, machine_id: &str, payload: &[u8]) -> Vec<u8> {
        match self.trigger_payload {
            TriggerPayload::Event => payload.to_vec(),
            TriggerPayload::MachineId => machine_id.as_bytes().to_vec(),
        }
    }
}

pub struct DeliveryManager<P: Publisher> {
    publisher: P,
    queue: OfflineQueue,
    topics: Topics,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    wrap_message: bool,
    grace: Duration,
    ack_timeout: Duration,
}

impl<P: Publisher> DeliveryManager<P> {
    pub fn new(
        publisher: P,
        queue: OfflineQueue,
        topics: Topics,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            publisher,
            queue,
            topics,
            state_rx,
            cancel: CancellationToken::new(),
            wrap_message: true,
            grace: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_wrap_message(mut self, wrap: bool) -> Self {
        self.wrap_message = wrap;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Runs until `cancel` fires or the event channel closes.
    ///
    /// Events still in the channel at cancellation are queued, not published.
    /// Cancellation also cuts short the wait of an event in flight, which is
    /// queued as well.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PublishEvent>,
        cancel: CancellationToken,
    ) {
        self.cancel = cancel.clone();
        info!(
            "Delivery started (queue: {}, grace: {:?})",
            self.queue.path().display(),
            self.grace
        );

        match self.queue.is_empty().await {
            Ok(false) => info!("Offline queue holds undelivered state changes"),
            Ok(true) => {}
            Err(e) => warn!("Cannot inspect offline queue: {}", e),
        }

        let connected = self.state_rx.borrow_and_update().is_connected();
        if connected {
            self.replay().await;
        }

        let mut session_gone = false;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Delivery cancelled");
                    break;
                }

                changed = self.state_rx.changed(), if !session_gone => {
                    if changed.is_err() {
                        warn!("Connection state channel closed, queuing from now on");
                        session_gone = true;
                        continue;
                    }
                    let connected = self.state_rx.borrow_and_update().is_connected();
                    if connected {
                        self.replay().await;
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.deliver(event).await,
                        None => {
                            debug!("Event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        let mut pending = 0;
        while let Ok(event) = events.try_recv() {
            self.enqueue_event(&event).await;
            pending += 1;
        }
        if pending > 0 {
            info!("Queued {} undelivered state change(s) at shutdown", pending);
        }
        info!("Delivery stopped");
    }

    /// Delivers one event, falling back to the queue.
    pub async fn deliver(&mut self, event: PublishEvent) {
        let payload = match self.encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Dropping state {}: {}", event.stato, e);
                return;
            }
        };

        if !self.wait_connected().await {
            warn!(
                "Broker unavailable, queuing state {} for {}",
                event.stato, event.machine_id
            );
            self.enqueue(&payload).await;
            return;
        }

        if self.replay().await == Replay::Kept {
            self.enqueue(&payload).await;
            return;
        }

        match self.publish_pair(&event.machine_id, &payload).await {
            Ok(()) => info!(
                "Published state {} for {} ({})",
                event.stato, event.machine_id, event.datetime_str
            ),
            Err(e) => {
                warn!("Publish of state {} failed: {}, queuing", event.stato, e);
                self.enqueue(&payload).await;
            }
        }
    }

    /// Republishes the whole queue in order, then removes it once the broker
    /// acknowledged every entry.
    pub async fn replay(&mut self) -> Replay {
        let entries = match self.queue.load().await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to read offline queue, publishing without it: {}", e);
                return Replay::Unreadable;
            }
        };
        if entries.is_empty() {
            return Replay::Drained;
        }

        let total = entries.len();
        info!("Replaying {} queued state change(s)", total);
        for (index, entry) in entries.iter().enumerate() {
            if let Err(e) = self.publish_pair(&entry.machine_id, &entry.payload).await {
                warn!(
                    "Replay interrupted at entry {}/{}: {}, keeping queue",
                    index + 1,
                    total,
                    e
                );
                return Replay::Kept;
            }
        }

        if !self.wait_acknowledged().await {
            warn!(
                "Broker did not acknowledge the replayed queue within {:?}, keeping it",
                self.ack_timeout
            );
            return Replay::Kept;
        }

        if let Err(e) = self.queue.clear().await {
            error!("Replayed queue could not be removed: {}", e);
            return Replay::Kept;
        }
        info!("Offline queue replayed and cleared");
        Replay::Drained
    }

    /// `false` on timeout or cancellation.
    async fn wait_connected(&mut self) -> bool {
        if self.publisher.is_connected() {
            return true;
        }
        if self.grace.is_zero() {
            return false;
        }

        let grace = self.grace;
        let state_rx = &mut self.state_rx;
        let reconnected = tokio::select! {
            _ = self.cancel.cancelled() => false,
            connected = async {
                matches!(
                    timeout(grace, state_rx.wait_for(ConnectionState::is_connected)).await,
                    Ok(Ok(_))
                )
            } => connected,
        };
        reconnected && self.publisher.is_connected()
    }

    async fn wait_acknowledged(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            acked = self.publisher.wait_acknowledged(self.ack_timeout) => acked,
        }
    }

    /// Status then trigger. Cancellation fails the pair.
    async fn publish_pair(&self, machine_id: &str, payload: &[u8]) -> Result<(), DeliveryError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::NotConnected.into()),
            result = self.send_pair(machine_id, payload) => result,
        }
    }

    async fn send_pair(&self, machine_id: &str, payload: &[u8]) -> Result<(), DeliveryError> {
        let status = self.topics.status(machine_id);
        self.publisher.publish(&status, payload, true).await?;

        let trigger = self.topics.trigger_body(machine_id, payload);
        self.publisher
            .publish(self.topics.trigger(), &trigger, true)
            .await
    }

    fn encode(&self, event: &PublishEvent) -> Result<Vec<u8>, DeliveryError> {
        Ok(event.to_payload(self.wrap_message)?)
    }

    async fn enqueue_event(&self, event: &PublishEvent) {
        match self.encode(event) {
            Ok(payload) => self.enqueue(&payload).await,
            Err(e) => error!("Dropping state {}: {}", event.stato, e),
        }
    }

    async fn enqueue(&self, payload: &[u8]) {
        if let Err(e) = self.queue.append(payload).await {
            error!("State change lost, offline queue unavailable: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    use tempfile::tempdir;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::stability::CompositeState;

    const STATUS: &str = "bma/press-07/semaforo/stato";
    const TRIGGER: &str = "bma/cambiostato";

    #[derive(Clone, Default)]
    struct MockPublisher {
        connected: Arc<AtomicBool>,
        sent: Arc<Mutex<Vec<(String, Vec<u8>, bool)>>>,
        /// Publishes accepted before every further one fails.
        budget: Arc<Mutex<Option<usize>>>,
        /// The broker never acknowledges.
        unacked: Arc<AtomicBool>,
    }

    impl MockPublisher {
        fn connected() -> Self {
            let mock = Self::default();
            mock.connected.store(true, Ordering::SeqCst);
            mock
        }

        fn sent(&self) -> Vec<(String, Vec<u8>, bool)> {
            self.sent.lock().unwrap().clone()
        }

        fn on(&self, topic: &str) -> Vec<Vec<u8>> {
            self.sent()
                .into_iter()
                .filter(|(t, _, _)| t == topic)
                .map(|(_, p, _)| p)
                .collect()
        }
    }

    #[async_trait]
    impl Publisher for MockPublisher {
        async fn publish(
            &self,
            topic: &str,
            payload: &[u8],
            retain: bool,
        ) -> Result<(), DeliveryError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransferError::NotConnected.into());
            }
            if let Some(budget) = self.budget.lock().unwrap().as_mut() {
                if *budget == 0 {
                    return Err(TransferError::NotConnected.into());
                }
                *budget -= 1;
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec(), retain));
            Ok(())
        }

        async fn wait_acknowledged(&self, _within: Duration) -> bool {
            !self.unacked.load(Ordering::SeqCst)
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn topics() -> Topics {
        Topics::new("bma/{machine_id}/semaforo/stato", TRIGGER, TriggerPayload::Event)
    }

    fn manager(
        publisher: MockPublisher,
        queue: OfflineQueue,
        state: ConnectionState,
    ) -> (DeliveryManager<MockPublisher>, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(state);
        let manager = DeliveryManager::new(publisher, queue, topics(), rx)
            .with_grace(Duration::from_millis(20));
        (manager, tx)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_status_topic_substitution() {
        assert_eq!(topics().status("press-07"), STATUS);
    }

    #[tokio::test]
    async fn test_connected_publishes_status_and_trigger() {
        let dir = tempdir().unwrap();
        let publisher = MockPublisher::connected();
        let (mut manager, _tx) = manager(
            publisher.clone(),
            OfflineQueue::new(dir.path().join("q.jsonl")),
            ConnectionState::Connected,
        );

        let event = PublishEvent::new(CompositeState::Red, "press-07");
        let expected = event.to_payload(true).unwrap();
        manager.deliver(event).await;

        let sent = publisher.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (STATUS.to_string(), expected.clone(), true));
        assert_eq!(sent[1], (TRIGGER.to_string(), expected, true));
    }

    #[tokio::test]
    async fn test_trigger_can_carry_machine_id() {
        let dir = tempdir().unwrap();
        let publisher = MockPublisher::connected();
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let mut manager = DeliveryManager::new(
            publisher.clone(),
            OfflineQueue::new(dir.path().join("q.jsonl")),
            Topics::new("s/{machine_id}", TRIGGER, TriggerPayload::MachineId),
            rx,
        )
        .with_wrap_message(false);

        manager
            .deliver(PublishEvent::new(CompositeState::Green, "press-07"))
            .await;

        assert_eq!(publisher.on(TRIGGER), vec![b"press-07".to_vec()]);
        assert_eq!(publisher.on("s/press-07").len(), 1);
        drop(tx);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_disconnected_event_is_queued() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("q.jsonl"));
        let publisher = MockPublisher::default();
        let (mut manager, _tx) = manager(
            publisher.clone(),
            queue.clone(),
            ConnectionState::Disconnected("down".into()),
        );

        manager
            .deliver(PublishEvent::new(CompositeState::Off, "press-07"))
            .await;

        assert!(publisher.sent().is_empty());
        assert_eq!(queue.load().await.unwrap().len(), 1);
        assert!(logs_contain("Broker unavailable"));
    }

    #[tokio::test]
    async fn test_outage_replays_queued_payloads_in_order() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("q.jsonl"));
        let publisher = MockPublisher::default();
        let (manager, state_tx) = manager(
            publisher.clone(),
            queue.clone(),
            ConnectionState::Disconnected("down".into()),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(events_rx, cancel.clone()));

        for state in [CompositeState::Red, CompositeState::Green, CompositeState::Off] {
            events_tx
                .send(PublishEvent::new(state, "press-07"))
                .unwrap();
        }

        let mut queued = Vec::new();
        for _ in 0..200 {
            queued = queue.load().await.unwrap();
            if queued.len() == 3 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queued.len(), 3);

        publisher.connected.store(true, Ordering::SeqCst);
        state_tx.send(ConnectionState::Connected).unwrap();
        wait_until(|| publisher.sent().len() == 6).await;

        let expected: Vec<Vec<u8>> = queued.into_iter().map(|e| e.payload).collect();
        assert_eq!(publisher.on(STATUS), expected);
        assert_eq!(publisher.on(TRIGGER), expected);
        assert!(queue.is_empty().await.unwrap());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_queue() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("q.jsonl"));
        for state in [CompositeState::Red, CompositeState::Green, CompositeState::Off] {
            let payload = PublishEvent::new(state, "press-07").to_payload(true).unwrap();
            queue.append(&payload).await.unwrap();
        }

        let publisher = MockPublisher::connected();
        *publisher.budget.lock().unwrap() = Some(3);
        let (mut manager, _tx) = manager(publisher.clone(), queue.clone(), ConnectionState::Connected);

        assert_eq!(manager.replay().await, Replay::Kept);
        assert_eq!(queue.load().await.unwrap().len(), 3);

        *publisher.budget.lock().unwrap() = None;
        assert_eq!(manager.replay().await, Replay::Drained);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_new_event_waits_behind_queue() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("q.jsonl"));
        let old = PublishEvent::new(CompositeState::Red, "press-07");
        queue.append(&old.to_payload(true).unwrap()).await.unwrap();

        let publisher = MockPublisher::connected();
        let (mut manager, _tx) = manager(publisher.clone(), queue.clone(), ConnectionState::Connected);
        let new = PublishEvent::new(CompositeState::Green, "press-07");
        manager.deliver(new.clone()).await;

        assert_eq!(
            publisher.on(STATUS),
            vec![old.to_payload(true).unwrap(), new.to_payload(true).unwrap()]
        );
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_events_are_queued_on_cancel() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("q.jsonl"));
        let publisher = MockPublisher::connected();
        let (manager, _tx) = manager(publisher.clone(), queue.clone(), ConnectionState::Connected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        events_tx
            .send(PublishEvent::new(CompositeState::Red, "press-07"))
            .unwrap();
        manager.run(events_rx, cancel).await;

        assert!(publisher.sent().is_empty());
        assert_eq!(queue.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_replay_is_noop() {
        let dir = tempdir().unwrap();
        let publisher = MockPublisher::connected();
        let (mut manager, _tx) = manager(
            publisher.clone(),
            OfflineQueue::new(dir.path().join("q.jsonl")),
            ConnectionState::Connected,
        );

        assert_eq!(manager.replay().await, Replay::Drained);
        assert!(publisher.sent().is_empty());
    }

    async fn queue_of_three(queue: &OfflineQueue) {
        for state in [CompositeState::Red, CompositeState::Green, CompositeState::Off] {
            let payload = PublishEvent::new(state, "press-07").to_payload(true).unwrap();
            queue.append(&payload).await.unwrap();
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unacknowledged_replay_keeps_queue() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("q.jsonl"));
        queue_of_three(&queue).await;

        let publisher = MockPublisher::connected();
        publisher.unacked.store(true, Ordering::SeqCst);
        let (mut manager, _tx) = manager(publisher.clone(), queue.clone(), ConnectionState::Connected);

        assert_eq!(manager.replay().await, Replay::Kept);
        assert_eq!(publisher.sent().len(), 6);
        assert_eq!(queue.load().await.unwrap().len(), 3);
        assert!(logs_contain("did not acknowledge"));

        publisher.unacked.store(false, Ordering::SeqCst);
        assert_eq!(manager.replay().await, Replay::Drained);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_through_silent_broker_keeps_queue() {
        use rumqttc::{AsyncClient, MqttOptions};
        use stacklight_mqtt::Unacked;

        let dir = tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("q.jsonl"));
        queue_of_three(&queue).await;

        // The event loop is never polled, so no PUBACK can arrive.
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("delivery-test", "127.0.0.1", 1883), 10);
        let publisher = MqttPublisher::new(client, Arc::new(AtomicBool::new(true)), Unacked::new());
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let mut manager = DeliveryManager::new(publisher, queue.clone(), topics(), rx)
            .with_ack_timeout(Duration::from_millis(50));

        assert_eq!(manager.replay().await, Replay::Kept);
        assert_eq!(queue.load().await.unwrap().len(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreadable_queue_does_not_block_live_events() {
        let dir = tempdir().unwrap();
        // A directory cannot be read as a queue file.
        let queue = OfflineQueue::new(dir.path());
        let publisher = MockPublisher::connected();
        let (mut manager, _tx) = manager(publisher.clone(), queue, ConnectionState::Connected);

        manager
            .deliver(PublishEvent::new(CompositeState::Red, "press-07"))
            .await;

        assert_eq!(publisher.on(STATUS).len(), 1);
        assert_eq!(publisher.on(TRIGGER).len(), 1);
        assert!(logs_contain("Failed to read offline queue"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait_for_broker() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("q.jsonl"));
        let publisher = MockPublisher::default();
        let (tx, rx) = watch::channel(ConnectionState::Disconnected("down".into()));
        let manager = DeliveryManager::new(publisher.clone(), queue.clone(), topics(), rx)
            .with_grace(Duration::from_secs(60));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(events_rx, cancel.clone()));

        events_tx
            .send(PublishEvent::new(CompositeState::Green, "press-07"))
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        timeout(Duration::from_secs(1), task)
            .await
            .expect("delivery must stop promptly")
            .unwrap();
        assert!(publisher.sent().is_empty());
        assert_eq!(queue.load().await.unwrap().len(), 1);
        drop(tx);
    }
}
