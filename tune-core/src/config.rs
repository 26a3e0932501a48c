//! Engine configuration.
//!
//! Every field has a default, so a JSON file only needs to name what it
//! changes:
//!
//! ```json
//! { "frame_length": 1024, "threshold": 0.1 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::pitch::{DEFAULT_FRAME_LENGTH, DEFAULT_THRESHOLD, MIN_FREQUENCY};

/// Knobs of the capture and detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Preferred capture rate in Hz. The device may settle on another.
    pub sample_rate: u32,
    /// Samples per analysis frame.
    pub frame_length: usize,
    /// Initial YIN threshold.
    pub threshold: f32,
    /// Frames with an RMS below this never reach the estimator.
    pub silence_threshold: f32,
    /// Period of the detection task.
    pub tick_interval_ms: u64,
    /// Initial output gain.
    pub volume: f32,
    /// Play the captured signal back through the default output device.
    pub monitor_output: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frame_length: DEFAULT_FRAME_LENGTH,
            threshold: DEFAULT_THRESHOLD,
            silence_threshold: 0.01,
            tick_interval_ms: 16,
            volume: 1.0,
            monitor_output: true,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Checks the values the engine cannot work with.
    ///
    /// The frame must hold two periods of the lowest vocal frequency at the
    /// configured rate, since YIN only searches half a frame.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(EngineError::config("sample_rate must be positive"));
        }
        if self.frame_length == 0 || self.frame_length % 2 != 0 {
            return Err(EngineError::config(format!(
                "frame_length must be a positive even number, got {}",
                self.frame_length
            )));
        }
        let longest_period = (self.sample_rate as f64 / MIN_FREQUENCY).ceil() as usize;
        if self.frame_length / 2 <= longest_period {
            return Err(EngineError::config(format!(
                "frame_length {} is too short for {} Hz at {} Hz",
                self.frame_length, MIN_FREQUENCY, self.sample_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.silence_threshold) {
            return Err(EngineError::config("silence_threshold must be within 0-1"));
        }
        if self.threshold.is_nan() || self.threshold <= 0.0 {
            return Err(EngineError::config("threshold must be positive"));
        }
        if self.tick_interval_ms == 0 {
            return Err(EngineError::config("tick_interval_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(EngineError::config("volume must be within 0-1"));
        }
        Ok(())
    }
}
