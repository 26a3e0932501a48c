//! Session parameters supplied by the host application.
//!
//! The engine only reads these. It never stores or validates them beyond
//! what the key and scale types already guarantee.

use serde::{Deserialize, Serialize};

use crate::tuning::{self, PitchClass, PitchCorrection, ScaleDefinition, ScaleKind};

/// Options a session runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    pub key: PitchClass,
    pub scale: ScaleKind,
    /// How fast a shifter should reach the target, 0 (slow) to 1 (instant).
    pub retune_speed: f32,
    /// Amount of natural variation a shifter should keep, 0 to 1.
    pub humanize: f32,
    /// Wet/dry balance of the corrected signal, 0 to 1.
    pub mix: f32,
    pub formant_preserve: bool,
    /// No correction at all.
    pub bypass: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            key: PitchClass::C,
            scale: ScaleKind::Major,
            retune_speed: 0.5,
            humanize: 0.5,
            mix: 1.0,
            formant_preserve: false,
            bypass: false,
        }
    }
}

impl SessionParams {
    pub fn scale_definition(&self) -> ScaleDefinition {
        ScaleDefinition::new(self.key, self.scale)
    }

    /// Correction for a detected frequency, `None` while bypassed.
    pub fn correction_for(&self, frequency_hz: f64) -> Option<PitchCorrection> {
        if self.bypass {
            return None;
        }
        Some(tuning::calculate_pitch_correction(frequency_hz, self.scale_definition()))
    }
}
