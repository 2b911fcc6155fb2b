//! Debounce of the transition into OFF.
//!
//! Active states (RED, GREEN, WAITING) are published as soon as they are
//! derived. OFF is held back until no active state has been seen for longer
//! than the persistence window, so a brief dark phase of a blinking or
//! flickering light does not produce an OFF event. Only changes of the
//! published state are reported.

use std::time::{Duration, Instant};

use tracing::debug;

use super::stability::CompositeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    /// Publishing an active state that is still being observed.
    Active,
    /// Observing OFF but still publishing the last active state.
    Grace,
    /// Publishing OFF, or nothing published yet.
    Inactive,
}

/// A change of the published state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: Option<CompositeState>,
    pub current: CompositeState,
}

#[derive(Debug, Clone)]
pub struct PersistenceGate {
    window: Duration,
    published: Option<CompositeState>,
    last_active: Option<Instant>,
    last_change: Option<Instant>,
    phase: GatePhase,
}

impl PersistenceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            published: None,
            last_active: None,
            last_change: None,
            phase: GatePhase::Inactive,
        }
    }

    /// Feeds one derived composite observed at `now`.
    ///
    /// Returns the change when the published state moves.
    #[must_use]
    pub fn observe(&mut self, composite: CompositeState, now: Instant) -> Option<StateChange> {
        let target = if !composite.is_off() {
            self.last_active = Some(now);
            self.phase = GatePhase::Active;
            composite
        } else {
            match (self.last_active, self.published) {
                (Some(seen), Some(held))
                    if !held.is_off() && now.saturating_duration_since(seen) <= self.window =>
                {
                    self.phase = GatePhase::Grace;
                    held
                }
                _ => {
                    self.phase = GatePhase::Inactive;
                    CompositeState::Off
                }
            }
        };

        if self.published == Some(target) {
            return None;
        }

        let change = StateChange {
            previous: self.published,
            current: target,
        };
        debug!(
            previous = ?change.previous,
            current = %change.current,
            "published state changed"
        );
        self.published = Some(target);
        self.last_change = Some(now);
        Some(change)
    }

    pub fn published(&self) -> Option<CompositeState> {
        self.published
    }

    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    /// Time of the last published change.
    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CompositeState::{Green, Off, Red, Waiting};

    const WINDOW: Duration = Duration::from_millis(500);

    #[test]
    fn test_first_observation_is_published() {
        let mut gate = PersistenceGate::new(WINDOW);
        let t0 = Instant::now();

        let change = gate.observe(Off, t0).unwrap();
        assert_eq!(change.previous, None);
        assert_eq!(change.current, Off);
        assert_eq!(gate.phase(), GatePhase::Inactive);
    }

    #[test]
    fn test_active_states_are_immediate() {
        let mut gate = PersistenceGate::new(WINDOW);
        let t0 = Instant::now();

        assert_eq!(gate.observe(Green, t0).unwrap().current, Green);
        assert!(gate.observe(Green, t0 + Duration::from_millis(100)).is_none());
        let change = gate.observe(Red, t0 + Duration::from_millis(200)).unwrap();
        assert_eq!(change.previous, Some(Green));
        assert_eq!(change.current, Red);
    }

    #[test]
    fn test_off_is_held_during_grace() {
        let mut gate = PersistenceGate::new(WINDOW);
        let t0 = Instant::now();

        let _ = gate.observe(Waiting, t0);
        assert!(gate.observe(Off, t0 + Duration::from_millis(300)).is_none());
        assert_eq!(gate.phase(), GatePhase::Grace);
        assert_eq!(gate.published(), Some(Waiting));
        assert_eq!(gate.last_change(), Some(t0));

        assert!(gate.observe(Off, t0 + Duration::from_millis(500)).is_none());

        let change = gate.observe(Off, t0 + Duration::from_millis(501)).unwrap();
        assert_eq!(change.current, Off);
        assert_eq!(gate.phase(), GatePhase::Inactive);
        assert_eq!(gate.last_change(), Some(t0 + Duration::from_millis(501)));
    }

    #[test]
    fn test_repeated_off_emits_once() {
        let mut gate = PersistenceGate::new(WINDOW);
        let t0 = Instant::now();
        let _ = gate.observe(Green, t0);

        let events = (1..=50)
            .filter_map(|i| gate.observe(Off, t0 + Duration::from_millis(100 * i)))
            .count();
        assert_eq!(events, 1);
    }

    #[test]
    fn test_active_observation_restarts_grace() {
        let mut gate = PersistenceGate::new(WINDOW);
        let t0 = Instant::now();

        let _ = gate.observe(Green, t0);
        assert!(gate.observe(Off, t0 + Duration::from_millis(400)).is_none());
        assert!(gate.observe(Green, t0 + Duration::from_millis(450)).is_none());
        assert!(gate.observe(Off, t0 + Duration::from_millis(900)).is_none());
        assert!(gate.observe(Off, t0 + Duration::from_millis(951)).is_some());
    }

    #[test]
    fn test_zero_window_publishes_off_immediately() {
        let mut gate = PersistenceGate::new(Duration::ZERO);
        let t0 = Instant::now();

        let _ = gate.observe(Green, t0);
        assert!(gate.observe(Off, t0 + Duration::from_millis(1)).is_some());
    }
}
