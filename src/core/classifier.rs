//! Instantaneous classification of a single reading.
//!
//! Pure function of `(sample, profile)`:
//!
//! - **sensor**: readings darker than `min_luminosity` are OFF; otherwise the
//!   nearest reference color wins, ties going to GREEN, then RED, then OFF.
//!   A RED verdict darker than `red_min_luminosity` is downgraded to OFF.
//! - **camera**: every calibrated non-OFF color whose coverage reaches its
//!   threshold is a candidate; the highest coverage wins, ties again in
//!   GREEN, RED order. No candidate means OFF. A color without a threshold
//!   makes the whole reading `ERROR_CONFIG`.

use std::{collections::BTreeMap, fmt};

use tracing::trace;

use super::calibration::{CalibrationProfile, Color, DetectionMode, Rgb};

/// One reading, as produced by a sampler.
#[derive(Debug, Clone, PartialEq)]
pub enum ColorSample {
    /// Averaged sensor reading.
    Rgb(Rgb),
    /// Mask coverage in percent per color. Absent colors count as 0 %.
    Coverage(BTreeMap<Color, f64>),
}

impl fmt::Display for ColorSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorSample::Rgb(rgb) => write!(f, "{rgb}"),
            ColorSample::Coverage(coverage) => {
                let mut first = true;
                for (color, pct) in coverage {
                    if !first {
                        f.write_str(" ")?;
                    }
                    first = false;
                    write!(f, "{color}={pct:.1}%")?;
                }
                Ok(())
            }
        }
    }
}

/// Per-sample verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstantLabel {
    Green,
    Red,
    Off,
    /// The profile cannot classify this reading.
    ErrorConfig,
    /// The reading itself failed.
    ErrorRead,
}

impl InstantLabel {
    pub fn is_error(self) -> bool {
        matches!(self, InstantLabel::ErrorConfig | InstantLabel::ErrorRead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstantLabel::Green => "GREEN",
            InstantLabel::Red => "RED",
            InstantLabel::Off => "OFF",
            InstantLabel::ErrorConfig => "ERROR_CONFIG",
            InstantLabel::ErrorRead => "ERROR_READ",
        }
    }
}

impl From<Color> for InstantLabel {
    fn from(color: Color) -> Self {
        match color {
            Color::Green => InstantLabel::Green,
            Color::Red => InstantLabel::Red,
            Color::Off => InstantLabel::Off,
        }
    }
}

impl fmt::Display for InstantLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Classifier<'a> {
    profile: &'a CalibrationProfile,
}

impl<'a> Classifier<'a> {
    pub fn new(profile: &'a CalibrationProfile) -> Self {
        Self { profile }
    }

    /// Classifies one reading. A reading shape that does not match the
    /// profile mode is a configuration error.
    pub fn classify(&self, sample: &ColorSample) -> InstantLabel {
        let label = match (self.profile.mode, sample) {
            (DetectionMode::Sensor, ColorSample::Rgb(rgb)) => self.classify_rgb(rgb),
            (DetectionMode::Camera, ColorSample::Coverage(coverage)) => {
                self.classify_coverage(coverage)
            }
            _ => InstantLabel::ErrorConfig,
        };
        trace!(%sample, %label, "classified reading");
        label
    }

    fn classify_rgb(&self, rgb: &Rgb) -> InstantLabel {
        let tuning = &self.profile.tuning;
        let luminosity = rgb.luminosity();
        if luminosity < tuning.min_luminosity {
            return InstantLabel::Off;
        }

        let mut nearest: Option<(Color, f64)> = None;
        for (color, state) in self.profile.states() {
            let Some(reference) = state.reference else {
                continue;
            };
            let distance = rgb.distance(&reference);
            if nearest.map_or(true, |(_, best)| distance < best) {
                nearest = Some((color, distance));
            }
        }

        match nearest {
            None => InstantLabel::ErrorConfig,
            Some((Color::Red, _)) if luminosity < tuning.red_min_luminosity => InstantLabel::Off,
            Some((color, _)) => color.into(),
        }
    }

    fn classify_coverage(&self, coverage: &BTreeMap<Color, f64>) -> InstantLabel {
        let mut winner: Option<(Color, f64)> = None;
        for (color, state) in self.profile.active_states() {
            let Some(threshold) = state.threshold_percent else {
                return InstantLabel::ErrorConfig;
            };
            let pct = coverage.get(&color).copied().unwrap_or(0.0);
            if pct >= threshold && winner.map_or(true, |(_, best)| pct > best) {
                winner = Some((color, pct));
            }
        }

        winner.map_or(InstantLabel::Off, |(color, _)| color.into())
    }
}
