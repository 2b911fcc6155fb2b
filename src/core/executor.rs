//! The sampling loop.
//!
//! One cooperative task paced by a fixed interval. Each cycle reads a sample,
//! classifies it, pushes the label into the [`StateBuffer`], derives the
//! composite state and runs it through the [`PersistenceGate`]. A change of
//! the published state is handed to the delivery task over an unbounded
//! channel, so the loop never waits on the network.
//!
//! Read failures and unclassifiable readings skip the cycle and leave the
//! buffer untouched. Nothing after startup stops the loop except cancellation.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    sync::{mpsc, watch},
    time::{interval, timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    calibration::CalibrationProfile,
    classifier::{Classifier, ColorSample, InstantLabel},
    error::SampleError,
    event::PublishEvent,
    gate::{GatePhase, PersistenceGate, StateChange},
    sampler::Sampler,
    stability::{CompositeState, LabelCounts, StabilityRules, StateBuffer},
};
use crate::config::monitor::PrefillMode;

/// Consecutive failures between two repeated error logs.
const ERROR_LOG_EVERY: u64 = 50;

/// Read-only view of the last cycle, for the live readout.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub sample: Option<ColorSample>,
    pub label: Option<InstantLabel>,
    pub counts: LabelCounts,
    pub buffer_len: usize,
    pub composite: Option<CompositeState>,
    pub published: Option<CompositeState>,
    /// Time since the published state last changed.
    pub held_for: Option<Duration>,
    pub phase: GatePhase,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            sample: None,
            label: None,
            counts: LabelCounts::default(),
            buffer_len: 0,
            composite: None,
            published: None,
            held_for: None,
            phase: GatePhase::Inactive,
        }
    }
}

pub struct Executor<S: Sampler> {
    sampler: S,
    profile: Arc<CalibrationProfile>,
    buffer: StateBuffer,
    rules: StabilityRules,
    gate: PersistenceGate,
    events_tx: mpsc::UnboundedSender<PublishEvent>,
    snapshot_tx: watch::Sender<Snapshot>,
    interval: Duration,
    read_timeout: Duration,
    prefill: PrefillMode,
    failures: u64,
    last_failure: Option<InstantLabel>,
}

impl<S: Sampler> Executor<S> {
    pub fn new(
        sampler: S,
        profile: Arc<CalibrationProfile>,
        events_tx: mpsc::UnboundedSender<PublishEvent>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Snapshot::default());
        Self {
            sampler,
            buffer: StateBuffer::new(profile.tuning.buffer_size),
            rules: StabilityRules::from(&profile.tuning),
            gate: PersistenceGate::new(profile.persistence_window()),
            profile,
            events_tx,
            snapshot_tx,
            interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(1),
            prefill: PrefillMode::default(),
            failures: 0,
            last_failure: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_prefill(mut self, prefill: PrefillMode) -> Self {
        self.prefill = prefill;
        self
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Fills the buffer before the first cycle.
    ///
    /// With [`PrefillMode::Samples`] up to three buffer lengths of readings
    /// are attempted; whatever is still missing is left empty, and a buffer
    /// without any valid reading falls back to OFF.
    pub async fn prefill(&mut self) {
        match self.prefill {
            PrefillMode::Off => {
                self.buffer.fill(InstantLabel::Off);
                info!("State buffer pre-filled with OFF ({} slots)", self.buffer.capacity());
            }
            PrefillMode::Samples => {
                let capacity = self.buffer.capacity();
                info!("Pre-filling state buffer with {} readings", capacity);
                let mut attempts = 0;
                while !self.buffer.is_full() && attempts < capacity * 3 {
                    attempts += 1;
                    match self.read().await {
                        Ok((_, label)) => {
                            self.buffer.push(label);
                        }
                        Err(e) => debug!("Pre-fill reading skipped: {}", e),
                    }
                }
                if self.buffer.is_empty() {
                    warn!("No valid reading during pre-fill, starting from OFF");
                    self.buffer.fill(InstantLabel::Off);
                } else {
                    let counts = self.buffer.counts();
                    info!(
                        "State buffer pre-filled: GREEN={} RED={} OFF={}",
                        counts.green, counts.red, counts.off
                    );
                }
            }
        }
    }

    /// Runs one sampling cycle. Returns the published change, if any.
    pub async fn step(&mut self) -> Option<StateChange> {
        let (sample, label) = match self.read().await {
            Ok((sample, label)) if label.is_error() => {
                self.note_failure(
                    label,
                    format!("reading {sample} cannot be classified with the current calibration"),
                );
                self.publish_snapshot(Some(sample), Some(label), None);
                return None;
            }
            Ok(reading) => reading,
            Err(e) => {
                self.note_failure(InstantLabel::ErrorRead, e.to_string());
                self.publish_snapshot(None, Some(InstantLabel::ErrorRead), None);
                return None;
            }
        };
        if self.failures > 0 {
            info!("Readings recovered after {} failed cycle(s)", self.failures);
            self.failures = 0;
            self.last_failure = None;
        }

        self.buffer.push(label);
        let composite = self.buffer.derive(&self.rules);
        let change = self.gate.observe(composite, Instant::now());
        self.publish_snapshot(Some(sample), Some(label), Some(composite));

        if let Some(change) = change {
            info!(
                "State change: {} -> {}",
                change.previous.map_or("-", CompositeState::wire_name),
                change.current
            );
            let event = PublishEvent::new(change.current, self.profile.machine_id.clone());
            if self.events_tx.send(event).is_err() {
                warn!("Delivery task is gone, state {} not sent", change.current);
            }
        }
        change
    }

    /// Runs until `cancel` fires, then closes the sampler.
    pub async fn run(mut self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.sampler.close().await;
                info!("Sampling cancelled during pre-fill");
                return;
            }
            _ = self.prefill() => {}
        }

        info!(
            "Sampling started for {} (mode: {}, interval: {:?})",
            self.profile.machine_id, self.profile.mode, self.interval
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.step() => {}
                    }
                }
            }
        }

        self.sampler.close().await;
        info!("Sampling stopped");
    }

    /// One classified reading. Timeouts count as read errors.
    async fn read(&mut self) -> Result<(ColorSample, InstantLabel), SampleError> {
        let sample = match timeout(self.read_timeout, self.sampler.sample()).await {
            Ok(result) => result?,
            Err(_) => return Err(SampleError::Timeout(self.read_timeout)),
        };
        let label = Classifier::new(&self.profile).classify(&sample);
        Ok((sample, label))
    }

    /// Logs the first failure of a streak and every `ERROR_LOG_EVERY` after.
    fn note_failure(&mut self, label: InstantLabel, reason: String) {
        if self.last_failure == Some(label) {
            self.failures += 1;
        } else {
            self.failures = 1;
            self.last_failure = Some(label);
        }

        if self.failures == 1 || self.failures % ERROR_LOG_EVERY == 0 {
            match label {
                InstantLabel::ErrorConfig => {
                    error!("{} ({} in a row)", reason, self.failures)
                }
                _ => warn!("Read error ({} in a row): {}", self.failures, reason),
            }
        }
    }

    fn publish_snapshot(
        &self,
        sample: Option<ColorSample>,
        label: Option<InstantLabel>,
        composite: Option<CompositeState>,
    ) {
        self.snapshot_tx.send_replace(Snapshot {
            sample,
            label,
            counts: self.buffer.counts(),
            buffer_len: self.buffer.len(),
            composite,
            published: self.gate.published(),
            held_for: self.gate.last_change().map(|at| at.elapsed()),
            phase: self.gate.phase(),
        });
    }
}
