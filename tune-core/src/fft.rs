//! # Fast Fourier Transform (FFT) Module
//!
//! Magnitude spectrum of the analysis tap for visualization. Not on the
//! detection path.

use rustfft::{FftPlanner, num_complex::Complex};

/// Removes the DC offset from a signal by making its average value zero.
fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Applies a Hann window to the input buffer to reduce spectral leakage.
fn apply_hann_window(buffer: &mut [f32]) {
    let n = buffer.len();
    if n < 2 {
        return;
    }
    let n_minus_1 = (n - 1) as f32;
    for (i, sample) in buffer.iter_mut().enumerate() {
        let multiplier = 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_minus_1).cos());
        *sample *= multiplier;
    }
}

/// Computes the magnitude spectrum of a frame up to the Nyquist bin.
///
/// The frame is DC-corrected and Hann-windowed first. Bin `k` covers
/// `k * sample_rate / frame.len()` Hz.
///
/// # Returns
/// * `frame.len() / 2` magnitudes, empty for an empty frame
pub fn magnitude_spectrum(frame: &[f32]) -> Vec<f32> {
    let len = frame.len();
    if len == 0 {
        return Vec::new();
    }

    let mut processed = frame.to_vec();
    remove_dc_offset(&mut processed);
    apply_hann_window(&mut processed);

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(len);

    let mut buffer: Vec<Complex<f32>> = processed
        .into_iter()
        .map(|sample| Complex { re: sample, im: 0.0 })
        .collect();
    fft.process(&mut buffer);

    buffer.iter().take(len / 2).map(|c| c.norm()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pitch::tests::sine;

    #[test]
    fn peak_lands_in_the_tone_bin() {
        // 1000 Hz at 32 kHz over 1024 samples is exactly bin 32.
        let frame = sine(1000.0, 32_000, 1024, 0.5);
        let spectrum = magnitude_spectrum(&frame);
        assert_eq!(spectrum.len(), 512);
        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bin, _)| bin);
        assert_eq!(peak, Some(32));
    }

    #[test]
    fn dc_is_removed() {
        let spectrum = magnitude_spectrum(&[0.25; 256]);
        assert!(spectrum.iter().all(|&m| m < 1e-3));
        assert!(magnitude_spectrum(&[]).is_empty());
    }
}
