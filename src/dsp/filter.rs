//! Two-pole (12 dB/octave) state-variable filter for interleaved buffers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    LowPass,
    HighPass,
    BandPass,
}

/// Trapezoidal SVF with per-channel integrator state.
struct Svf {
    ic1eq: Vec<f32>,
    ic2eq: Vec<f32>,
    k: f32,
    a1: f32,
    a2: f32,
    a3: f32,
}

impl Svf {
    fn new(channels: usize, sample_rate: u32, cutoff_hz: f32, q: f32) -> Self {
        let nyquist_guard = sample_rate as f32 * 0.45;
        let cutoff = cutoff_hz.clamp(20.0, nyquist_guard.max(21.0));
        let q = q.clamp(0.1, 10.0);
        let g = (std::f32::consts::PI * cutoff / sample_rate as f32).tan();
        let k = 1.0 / q;
        let a1 = 1.0 / (1.0 + g * (g + k));
        let a2 = g * a1;
        let a3 = g * a2;
        Self {
            ic1eq: vec![0.0; channels],
            ic2eq: vec![0.0; channels],
            k,
            a1,
            a2,
            a3,
        }
    }

    /// One sample through channel `c`, returning (low, high, band).
    #[inline]
    fn tick(&mut self, c: usize, x: f32) -> (f32, f32, f32) {
        let v3 = x - self.ic2eq[c];
        let v1 = self.a1 * self.ic1eq[c] + self.a2 * v3;
        let v2 = self.ic2eq[c] + self.a2 * self.ic1eq[c] + self.a3 * v3;
        self.ic1eq[c] = 2.0 * v1 - self.ic1eq[c];
        self.ic2eq[c] = 2.0 * v2 - self.ic2eq[c];
        let low = v2;
        let band = v1;
        let high = x - self.k * band - low;
        (low, high, band)
    }
}

/// Filter `samples` in place.
pub fn apply_filter(
    samples: &mut [f32],
    channels: usize,
    sample_rate: u32,
    kind: FilterKind,
    cutoff_hz: f32,
) {
    let ch = channels.max(1);
    if sample_rate == 0 {
        return;
    }
    let mut svf = Svf::new(ch, sample_rate, cutoff_hz, std::f32::consts::FRAC_1_SQRT_2);
    for frame in samples.chunks_exact_mut(ch) {
        for (c, s) in frame.iter_mut().enumerate() {
            let (low, high, band) = svf.tick(c, *s);
            *s = match kind {
                FilterKind::LowPass => low,
                FilterKind::HighPass => high,
                FilterKind::BandPass => band,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn rms_after(kind: FilterKind, freq: f32, cutoff: f32) -> f32 {
        let sr = 44100;
        let mut x: Vec<f32> = (0..sr)
            .map(|i| (2.0 * PI * freq * i as f32 / sr as f32).sin())
            .collect();
        apply_filter(&mut x, 1, sr as u32, kind, cutoff);
        let tail = &x[sr / 2..];
        (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt()
    }

    #[test]
    fn test_highpass_removes_bass() {
        let bass = rms_after(FilterKind::HighPass, 50.0, 300.0);
        let treble = rms_after(FilterKind::HighPass, 3000.0, 300.0);
        assert!(bass < 0.05, "bass {}", bass);
        assert!(treble > 0.65, "treble {}", treble);
    }

    #[test]
    fn test_lowpass_removes_treble() {
        let bass = rms_after(FilterKind::LowPass, 60.0, 400.0);
        let treble = rms_after(FilterKind::LowPass, 6000.0, 400.0);
        assert!(bass > 0.65, "bass {}", bass);
        assert!(treble < 0.01, "treble {}", treble);
    }

    #[test]
    fn test_bandpass_peaks_at_cutoff() {
        let centre = rms_after(FilterKind::BandPass, 1000.0, 1000.0);
        let far = rms_after(FilterKind::BandPass, 50.0, 1000.0);
        assert!(centre > far * 5.0);
    }

    #[test]
    fn test_channels_filtered_independently() {
        let mut x = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        apply_filter(&mut x, 2, 44100, FilterKind::LowPass, 1000.0);
        assert!(x[1].abs() < 1e-9 && x[3].abs() < 1e-9 && x[5].abs() < 1e-9);
        assert!(x[0] > 0.0);
    }
}
