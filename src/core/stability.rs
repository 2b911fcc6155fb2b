//! Sliding window of instantaneous labels and composite-state derivation.
//!
//! Rules, in order:
//!
//! 1. `red >= red_floor` gives RED, whatever else is in the window.
//! 2. `off / len >= steady_fraction` gives OFF; otherwise `green / len >= steady_fraction` gives GREEN.
//! 3. A window holding both GREEN and OFF is blinking, so WAITING.
//! 4. Otherwise the more frequent of GREEN and OFF wins; ties and an empty window give OFF.

use std::{collections::VecDeque, fmt};

use serde::{Deserialize, Serialize};

use super::{calibration::Tuning, classifier::InstantLabel};

/// Debounced state of the light. Serialized with its wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeState {
    #[serde(rename = "ROSSO")]
    Red,
    #[serde(rename = "VERDE")]
    Green,
    /// Blinking green.
    #[serde(rename = "ATTESA")]
    Waiting,
    #[serde(rename = "SPENTO")]
    Off,
}

impl CompositeState {
    /// Name used on the wire and in logs.
    pub fn wire_name(self) -> &'static str {
        match self {
            CompositeState::Red => "ROSSO",
            CompositeState::Green => "VERDE",
            CompositeState::Waiting => "ATTESA",
            CompositeState::Off => "SPENTO",
        }
    }

    pub fn is_off(self) -> bool {
        matches!(self, CompositeState::Off)
    }
}

impl fmt::Display for CompositeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Parameters of the derivation rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityRules {
    pub steady_fraction: f64,
    pub red_floor: usize,
}

impl Default for StabilityRules {
    fn default() -> Self {
        Self {
            steady_fraction: 0.9,
            red_floor: 3,
        }
    }
}

impl From<&Tuning> for StabilityRules {
    fn from(tuning: &Tuning) -> Self {
        Self {
            steady_fraction: tuning.steady_state_fraction,
            red_floor: tuning.red_floor,
        }
    }
}

/// Label counts of the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelCounts {
    pub red: usize,
    pub green: usize,
    pub off: usize,
}

impl LabelCounts {
    pub fn total(&self) -> usize {
        self.red + self.green + self.off
    }
}

/// Bounded ring of the most recent GREEN/RED/OFF labels.
#[derive(Debug, Clone)]
pub struct StateBuffer {
    labels: VecDeque<InstantLabel>,
    capacity: usize,
}

impl StateBuffer {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            labels: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a label, evicting the oldest when full.
    ///
    /// Error labels are refused and leave the buffer untouched; returns
    /// whether the label was stored.
    pub fn push(&mut self, label: InstantLabel) -> bool {
        if label.is_error() {
            return false;
        }
        if self.labels.len() == self.capacity {
            self.labels.pop_front();
        }
        self.labels.push_back(label);
        true
    }

    /// Replaces the contents with `capacity` copies of `label`.
    pub fn fill(&mut self, label: InstantLabel) {
        self.labels.clear();
        for _ in 0..self.capacity {
            self.push(label);
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.labels.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn counts(&self) -> LabelCounts {
        let mut counts = LabelCounts::default();
        for label in &self.labels {
            match label {
                InstantLabel::Red => counts.red += 1,
                InstantLabel::Green => counts.green += 1,
                InstantLabel::Off => counts.off += 1,
                InstantLabel::ErrorConfig | InstantLabel::ErrorRead => {}
            }
        }
        counts
    }

    /// Composite state of the current window.
    #[must_use]
    pub fn derive(&self, rules: &StabilityRules) -> CompositeState {
        let counts = self.counts();
        let len = counts.total();
        if len == 0 {
            return CompositeState::Off;
        }

        if counts.red >= rules.red_floor {
            return CompositeState::Red;
        }

        let share = |n: usize| n as f64 / len as f64;
        if share(counts.off) >= rules.steady_fraction {
            return CompositeState::Off;
        }
        if share(counts.green) >= rules.steady_fraction {
            return CompositeState::Green;
        }

        if counts.green > 0 && counts.off > 0 {
            return CompositeState::Waiting;
        }

        if counts.green > counts.off {
            CompositeState::Green
        } else {
            CompositeState::Off
        }
    }
}
