//! Calibration profile: reference colors, thresholds and tuning parameters.
//!
//! The profile is a JSON document written by the calibration tooling. State
//! entries can live under a `states` object or at the top level, and are
//! keyed by any of the accepted spellings:
//!
//! | color | keys                        |
//! |-------|-----------------------------|
//! | GREEN | `GREEN`, `VERDE`, `verde`   |
//! | RED   | `RED`, `ROSSO`, `non_verde` |
//! | OFF   | `OFF`, `SPENTO`, `buio`     |
//!
//! Each entry holds a reference color, either as `{"reference": {"R":..,"G":..,"B":..}}`
//! or inline as `{"R":..,"G":..,"B":..}`, and an optional `threshold_percent`.
//!
//! ```json
//! {
//!   "machine_id": "press-07",
//!   "verde":     {"R": 20,  "G": 180, "B": 40},
//!   "non_verde": {"R": 190, "G": 30,  "B": 25},
//!   "buio":      {"R": 3,   "G": 4,   "B": 3}
//! }
//! ```
//!
//! Missing references or machine id are fatal at load time. Numeric tuning
//! fields fall back to their defaults.

use std::{collections::BTreeMap, fmt, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{config::ConfigError, print_warn};

/// An 8-bit RGB triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    #[serde(rename = "R")]
    pub r: u8,
    #[serde(rename = "G")]
    pub g: u8,
    #[serde(rename = "B")]
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Scales 16-bit raw channel counts down to 8 bits: `min(255, raw / 256)`.
    pub fn from_raw16(r: u16, g: u16, b: u16) -> Self {
        let scale = |raw: u16| (raw / 256).min(255) as u8;
        Self::new(scale(r), scale(g), scale(b))
    }

    /// Channel sum.
    pub fn luminosity(&self) -> u32 {
        u32::from(self.r) + u32::from(self.g) + u32::from(self.b)
    }

    /// Euclidean distance in RGB space.
    pub fn distance(&self, other: &Rgb) -> f64 {
        let dr = f64::from(self.r) - f64::from(other.r);
        let dg = f64::from(self.g) - f64::from(other.g);
        let db = f64::from(self.b) - f64::from(other.b);
        (dr * dr + dg * dg + db * db).sqrt()
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R={} G={} B={}", self.r, self.g, self.b)
    }
}

/// A calibrated light color. The declaration order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Color {
    Green,
    Red,
    Off,
}

impl Color {
    pub const ALL: [Color; 3] = [Color::Green, Color::Red, Color::Off];

    /// Resolves any accepted key spelling.
    pub fn from_key(key: &str) -> Option<Color> {
        match key {
            "GREEN" | "VERDE" | "verde" | "green" => Some(Color::Green),
            "RED" | "ROSSO" | "non_verde" | "red" => Some(Color::Red),
            "OFF" | "SPENTO" | "buio" | "off" => Some(Color::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Green => "GREEN",
            Color::Red => "RED",
            Color::Off => "OFF",
        }
    }

    fn accepted_keys(&self) -> &'static str {
        match self {
            Color::Green => "GREEN/VERDE/verde",
            Color::Red => "RED/ROSSO/non_verde",
            Color::Off => "OFF/SPENTO/buio",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Nearest reference color of an averaged RGB reading.
    #[default]
    Sensor,
    /// Per-color mask coverage percentages against thresholds.
    Camera,
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMode::Sensor => f.write_str("sensor"),
            DetectionMode::Camera => f.write_str("camera"),
        }
    }
}

/// Calibration of a single color.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StateCalibration {
    pub reference: Option<Rgb>,
    pub threshold_percent: Option<f64>,
}

/// Settings handed to the external sensor driver.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SensorSettings {
    pub gain: u16,
    pub integration_time_ms: f64,

    /// Readings averaged into one sample.
    #[validate(range(
        min = 1,
        max = 100,
        message = "samples_per_reading must be between 1 and 100"
    ))]
    pub samples_per_reading: u32,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            gain: 16,
            integration_time_ms: 250.0,
            samples_per_reading: 1,
        }
    }
}

/// Buffer and gate tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Tuning {
    #[validate(range(
        min = 1,
        max = 1000,
        message = "buffer_size must be between 1 and 1000"
    ))]
    pub buffer_size: usize,

    /// Share of the buffer that makes OFF or GREEN steady.
    #[validate(range(
        min = 0.01,
        max = 1.0,
        message = "steady_state_fraction must be within (0, 1]"
    ))]
    pub steady_state_fraction: f64,

    /// RED readings in the buffer that force RED.
    #[validate(range(min = 1, message = "red_floor must be at least 1"))]
    pub red_floor: usize,

    /// Channel sum below which a reading is OFF.
    pub min_luminosity: u32,

    /// Channel sum a RED verdict must reach.
    pub red_min_luminosity: u32,

    /// How long OFF must persist before it is published.
    #[validate(range(
        min = 0.0,
        max = 60.0,
        message = "persistence_seconds must be between 0 and 60"
    ))]
    pub persistence_seconds: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            buffer_size: 20,
            steady_state_fraction: 0.9,
            red_floor: 3,
            min_luminosity: 50,
            red_min_luminosity: 100,
            persistence_seconds: 0.5,
        }
    }
}

/// On-disk shape of the profile, before alias resolution.
#[derive(Debug, Deserialize, Validate)]
struct RawProfile {
    #[serde(default)]
    machine_id: Option<String>,

    #[serde(default)]
    mode: DetectionMode,

    #[serde(default)]
    states: BTreeMap<String, serde_json::Value>,

    #[serde(flatten)]
    #[validate(nested)]
    tuning: Tuning,

    #[serde(default)]
    #[validate(nested)]
    sensor: SensorSettings,

    #[serde(default)]
    debug: bool,

    #[serde(default)]
    probe_host: Option<String>,

    /// Everything else: top-level state entries and unrelated keys.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    reference: Option<Rgb>,
    #[serde(rename = "R")]
    r: Option<u8>,
    #[serde(rename = "G")]
    g: Option<u8>,
    #[serde(rename = "B")]
    b: Option<u8>,
    threshold_percent: Option<f64>,
}

impl RawState {
    fn into_calibration(self) -> StateCalibration {
        let inline = match (self.r, self.g, self.b) {
            (Some(r), Some(g), Some(b)) => Some(Rgb::new(r, g, b)),
            _ => None,
        };
        StateCalibration {
            reference: self.reference.or(inline),
            threshold_percent: self.threshold_percent,
        }
    }
}

/// Validated, immutable calibration.
#[derive(Debug, Clone)]
pub struct CalibrationProfile {
    pub machine_id: String,
    pub mode: DetectionMode,
    states: BTreeMap<Color, StateCalibration>,
    pub tuning: Tuning,
    pub sensor: SensorSettings,
    /// Forces debug-level logging.
    pub debug: bool,
    pub probe_host: Option<String>,
}

impl CalibrationProfile {
    /// Reads and validates the profile at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawProfile =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        let machine_id = raw
            .machine_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConfigError::MissingCalibration("machine_id".into()))?;

        let mut states = BTreeMap::new();
        let entries = raw.states.into_iter().chain(raw.extra);
        for (key, value) in entries {
            let Some(color) = Color::from_key(&key) else {
                if value.is_object() {
                    print_warn!("Ignoring calibration entry '{}'", key);
                }
                continue;
            };
            let state: RawState = serde_json::from_value(value).map_err(|e| {
                ConfigError::InvalidCalibration(format!("entry '{}': {}", key, e))
            })?;
            if states.insert(color, state.into_calibration()).is_some() {
                return Err(ConfigError::InvalidCalibration(format!(
                    "{} is calibrated more than once (keys {})",
                    color,
                    color.accepted_keys()
                )));
            }
        }

        let profile = CalibrationProfile {
            machine_id,
            mode: raw.mode,
            states,
            tuning: raw.tuning,
            sensor: raw.sensor,
            debug: raw.debug,
            probe_host: raw.probe_host.filter(|h| !h.is_empty()),
        };
        profile.check_completeness()?;
        Ok(profile)
    }

    fn check_completeness(&self) -> Result<(), ConfigError> {
        match self.mode {
            DetectionMode::Sensor => {
                for color in Color::ALL {
                    if self.reference(color).is_none() {
                        return Err(ConfigError::MissingCalibration(format!(
                            "reference color for {} (keys {})",
                            color,
                            color.accepted_keys()
                        )));
                    }
                }
            }
            DetectionMode::Camera => {
                if !self.states.keys().any(|c| *c != Color::Off) {
                    return Err(ConfigError::MissingCalibration(
                        "at least one of GREEN or RED must be calibrated in camera mode".into(),
                    ));
                }
                for (color, state) in self.active_states() {
                    if state.threshold_percent.is_none() {
                        print_warn!(
                            "{} has no threshold_percent; camera readings will be reported as configuration errors",
                            color
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn state(&self, color: Color) -> Option<&StateCalibration> {
        self.states.get(&color)
    }

    pub fn reference(&self, color: Color) -> Option<Rgb> {
        self.state(color).and_then(|s| s.reference)
    }

    /// Calibrated colors in tie-break order.
    pub fn states(&self) -> impl Iterator<Item = (Color, &StateCalibration)> {
        self.states.iter().map(|(c, s)| (*c, s))
    }

    /// Calibrated colors other than OFF, in tie-break order.
    pub fn active_states(&self) -> impl Iterator<Item = (Color, &StateCalibration)> {
        self.states().filter(|(c, _)| *c != Color::Off)
    }

    pub fn persistence_window(&self) -> Duration {
        Duration::from_secs_f64(self.tuning.persistence_seconds)
    }
}
