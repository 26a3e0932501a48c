//! # Pitch Detection Module
//!
//! This module implements the YIN fundamental-frequency estimator
//! (de Cheveigné & Kawahara, 2002) tuned for the singing voice.
//!
//! ## Features
//! - Cumulative mean normalized difference with an absolute threshold
//! - Descent to the bottom of the first valley below the threshold
//! - Interpolated check for a shorter period hidden between integer lags
//! - Parabolic interpolation for sub-sample accuracy
//! - Vocal band guard (80 Hz to 1200 Hz)
//! - Scratch buffers allocated once per estimator

/// Default number of samples per analysis frame.
pub const DEFAULT_FRAME_LENGTH: usize = 2048;
/// Default CMNDF threshold.
pub const DEFAULT_THRESHOLD: f32 = 0.15;
/// Lowest threshold `set_threshold` accepts.
pub const MIN_THRESHOLD: f32 = 0.01;
/// Highest threshold `set_threshold` accepts.
pub const MAX_THRESHOLD: f32 = 0.5;
/// Lower edge of the vocal band in Hz.
pub const MIN_FREQUENCY: f64 = 80.0;
/// Upper edge of the vocal band in Hz.
pub const MAX_FREQUENCY: f64 = 1200.0;
/// How much shallower than the chosen valley an earlier valley may be and
/// still be taken as the period.
const SHORTER_PERIOD_MARGIN: f64 = 0.1;

/// A detected fundamental.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    /// Fundamental frequency in Hz, always inside the vocal band.
    pub frequency_hz: f64,
    /// `1 - CMNDF` at the chosen lag, clamped to `[0, 1]`.
    pub confidence: f64,
}

/// Anything that can turn one frame into an optional pitch.
pub trait PitchDetector {
    fn detect(&mut self, frame: &[f32]) -> Option<PitchEstimate>;
}

/// Root-mean-square level of a frame.
pub fn rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    (signal.iter().map(|&s| s * s).sum::<f32>() / signal.len() as f32).sqrt()
}

/// A YIN pitch estimator bound to one sample rate and one frame length.
///
/// The difference and CMNDF arrays are sized to half a frame at
/// construction and reused by every call to [`YinEstimator::detect`], so
/// detection does not allocate.
#[derive(Debug, Clone)]
pub struct YinEstimator {
    sample_rate: u32,
    frame_length: usize,
    threshold: f32,
    difference: Vec<f64>,
    cmndf: Vec<f64>,
}

impl YinEstimator {
    /// Creates an estimator.
    ///
    /// # Arguments
    /// * `sample_rate` - Sample rate of every frame in Hz
    /// * `frame_length` - Number of samples per frame, fixed for life
    /// * `threshold` - CMNDF threshold, clamped to `[0.01, 0.5]`
    ///
    /// # Panics
    /// * If `frame_length` is less than 4 or `sample_rate` is zero
    pub fn new(sample_rate: u32, frame_length: usize, threshold: f32) -> Self {
        assert!(frame_length >= 4, "frame length must be at least 4 samples");
        assert!(sample_rate > 0, "sample rate must be positive");
        let half = frame_length / 2;
        Self {
            sample_rate,
            frame_length,
            threshold: clamp_threshold(threshold),
            difference: vec![0.0; half],
            cmndf: vec![0.0; half],
        }
    }

    /// Creates an estimator with the default frame length and threshold.
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self::new(sample_rate, DEFAULT_FRAME_LENGTH, DEFAULT_THRESHOLD)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Sets the CMNDF threshold, clamped to `[0.01, 0.5]`.
    ///
    /// Lower is stricter: fewer false positives, more misses on breathy
    /// input.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = clamp_threshold(threshold);
    }

    /// Smallest lag searched, the period of the 1200 Hz ceiling.
    fn min_tau(&self) -> usize {
        ((self.sample_rate as f64 / MAX_FREQUENCY).floor() as usize).max(1)
    }

    /// Estimates the fundamental frequency of one frame.
    ///
    /// # Returns
    /// * `Some(estimate)` - A pitch inside 80 Hz to 1200 Hz
    /// * `None` - No lag dipped under the threshold, or the result fell
    ///   outside the vocal band
    ///
    /// # Panics
    /// * If `frame.len()` differs from the estimator's frame length
    pub fn detect(&mut self, frame: &[f32]) -> Option<PitchEstimate> {
        assert_eq!(
            frame.len(),
            self.frame_length,
            "frame length must match the estimator's frame length"
        );

        self.difference_function(frame);
        self.cumulative_mean_normalize();

        let tau = self.absolute_threshold(self.min_tau())?;
        let tau = self.earlier_valley(tau).unwrap_or(tau);

        let (refined_tau, refined_value) = self.parabolic_interpolation(tau);
        let frequency_hz = self.sample_rate as f64 / refined_tau;
        if !frequency_hz.is_finite() || !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&frequency_hz) {
            return None;
        }

        Some(PitchEstimate {
            frequency_hz,
            confidence: (1.0 - refined_value).clamp(0.0, 1.0),
        })
    }

    // --- Step 1: d(tau) = sum (x[i] - x[i + tau])^2 over half a frame ---
    fn difference_function(&mut self, frame: &[f32]) {
        let half = self.frame_length / 2;
        self.difference[0] = 1.0;
        for tau in 1..half {
            let mut sum = 0.0;
            for i in 0..half {
                let delta = (frame[i] - frame[i + tau]) as f64;
                sum += delta * delta;
            }
            self.difference[tau] = sum;
        }
    }

    // --- Step 2: normalize each lag by the running mean of d(1..=tau) ---
    fn cumulative_mean_normalize(&mut self) {
        self.cmndf[0] = 1.0;
        let mut running_sum = 0.0;
        for tau in 1..self.cmndf.len() {
            running_sum += self.difference[tau];
            self.cmndf[tau] = if running_sum > 0.0 {
                self.difference[tau] * tau as f64 / running_sum
            } else {
                1.0
            };
        }
    }

    // --- Step 3: first lag under the threshold, then down to its valley floor ---
    fn absolute_threshold(&self, min_tau: usize) -> Option<usize> {
        let threshold = self.threshold as f64;
        let len = self.cmndf.len();
        let mut tau = (min_tau..len).find(|&t| self.cmndf[t] < threshold)?;
        while tau + 1 < len && self.cmndf[tau + 1] < self.cmndf[tau] {
            tau += 1;
        }
        Some(tau)
    }

    /// First valley before `tau` whose interpolated floor is under the
    /// threshold, or within [`SHORTER_PERIOD_MARGIN`] of the chosen valley.
    ///
    /// Integer lags can straddle a short fractional period so that none of
    /// them crosses the threshold while a later multiple does. Without this
    /// step a tone above the ceiling is reported as one of its sub-octaves.
    fn earlier_valley(&self, tau: usize) -> Option<usize> {
        let limit = (self.threshold as f64).max(self.cmndf[tau] + SHORTER_PERIOD_MARGIN);
        (2..tau)
            .filter(|&t| self.cmndf[t] <= self.cmndf[t - 1] && self.cmndf[t] <= self.cmndf[t + 1])
            .find(|&t| {
                let (_, floor) = self.parabolic_interpolation(t);
                floor.min(self.cmndf[t]) < limit
            })
    }

    // --- Step 4: fit a parabola through tau - 1, tau, tau + 1 ---
    fn parabolic_interpolation(&self, tau: usize) -> (f64, f64) {
        let value = self.cmndf[tau];
        if tau == 0 || tau + 1 >= self.cmndf.len() {
            return (tau as f64, value);
        }

        let before = self.cmndf[tau - 1];
        let after = self.cmndf[tau + 1];
        let denominator = 2.0 * (2.0 * value - after - before);
        if denominator.abs() < f64::EPSILON {
            return (tau as f64, value);
        }

        let shift = (after - before) / denominator;
        let vertex = value - 0.25 * (before - after) * shift;
        (tau as f64 + shift, vertex)
    }
}

impl PitchDetector for YinEstimator {
    fn detect(&mut self, frame: &[f32]) -> Option<PitchEstimate> {
        YinEstimator::detect(self, frame)
    }
}

pub(crate) fn clamp_threshold(threshold: f32) -> f32 {
    if threshold.is_nan() {
        return DEFAULT_THRESHOLD;
    }
    threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}
