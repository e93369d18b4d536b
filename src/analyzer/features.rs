//! Native feature extraction over mono PCM.
//!
//! One STFT pass yields a spectral-flux onset envelope and a chroma profile.
//! Tempo comes from the autocorrelation of the onset envelope weighted by a
//! log-normal prior around 120 BPM; beats are an even grid whose phase best
//! lines up with the onsets. Everything downstream (energy, vocal activity,
//! phrases, highlights) is beat-synchronous.

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use crate::config::AnalysisConfig;
use crate::dsp::filter::{FilterKind, apply_filter};
use crate::grid::phrase_starts;
use crate::key::Key;
use crate::track::{Highlight, Segment, SegmentLabel};

const FRAME_LEN: usize = 2048;
const MIN_BPM: f64 = 60.0;
const MAX_BPM: f64 = 200.0;
const PRIOR_BPM: f64 = 120.0;
/// Width of the tempo prior in octaves.
const PRIOR_OCTAVES: f64 = 1.0;
const CHROMA_MIN_HZ: f64 = 55.0;
const CHROMA_MAX_HZ: f64 = 5000.0;

/// Krumhansl-Kessler key profiles, tonic first.
const MAJOR_PROFILE: [f64; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];
const MINOR_PROFILE: [f64; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

/// Everything the extractor derives from the audio itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub duration: f64,
    pub bpm: f64,
    pub loudness_db: f64,
    /// Empty when no pitched content was found.
    pub key: String,
    pub beat_times: Vec<f64>,
    pub segments: Vec<Segment>,
    pub energy_curve: Vec<f64>,
    pub vocal_curve: Vec<f64>,
    pub highlights: Vec<Highlight>,
}

/// Run the full extraction on mono samples at `sample_rate`.
pub fn extract(mono: &[f32], sample_rate: u32, cfg: &AnalysisConfig) -> Features {
    let hop = cfg.hop_length.max(1);
    let duration = if sample_rate == 0 {
        0.0
    } else {
        mono.len() as f64 / sample_rate as f64
    };

    let spectral = spectral_frames(mono, hop, sample_rate);
    let onset = smooth(&spectral.flux);
    let bpm = estimate_tempo(&onset, sample_rate, hop);
    let beat_frames = track_beats(&onset, bpm, sample_rate, hop);
    let beat_times: Vec<f64> = beat_frames
        .iter()
        .map(|&f| f as f64 * hop as f64 / sample_rate.max(1) as f64)
        .collect();

    let rms = frame_rms(mono, hop);
    let mean_rms = if rms.is_empty() {
        0.0
    } else {
        rms.iter().map(|&r| r as f64).sum::<f64>() / rms.len() as f64
    };
    let loudness_db = 20.0 * (mean_rms + 1e-6).log10();
    let energy_curve = normalize_max(&beat_sync(&rms, &beat_frames));

    let mut vocal = mono.to_vec();
    if sample_rate > 0 {
        apply_filter(&mut vocal, 1, sample_rate, FilterKind::HighPass, cfg.vocal_low_hz);
        apply_filter(&mut vocal, 1, sample_rate, FilterKind::LowPass, cfg.vocal_high_hz);
    }
    let vocal_curve = normalize_max(&beat_sync(&frame_rms(&vocal, hop), &beat_frames));

    let segments = label_phrases(&beat_times, &energy_curve, &vocal_curve, duration, cfg);
    let key = estimate_key(&spectral.chroma);
    let highlights = detect_highlights(&beat_times, &energy_curve, cfg);

    log::debug!(
        "Extracted {:.1} BPM, {} beats, {} segments, key {:?}",
        bpm,
        beat_times.len(),
        segments.len(),
        key
    );

    Features {
        duration,
        bpm,
        loudness_db,
        key,
        beat_times,
        segments,
        energy_curve,
        vocal_curve,
        highlights,
    }
}

struct Spectral {
    flux: Vec<f32>,
    chroma: [f64; 12],
}

fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos())
        .collect()
}

fn frame_count(len: usize, hop: usize) -> usize {
    if len == 0 { 0 } else { len / hop + 1 }
}

/// Centred STFT frames: positive log-magnitude flux per frame plus the
/// magnitude summed into pitch classes over the whole signal.
fn spectral_frames(mono: &[f32], hop: usize, sample_rate: u32) -> Spectral {
    let n_frames = frame_count(mono.len(), hop);
    let bins = FRAME_LEN / 2 + 1;
    let mut chroma = [0.0f64; 12];
    if n_frames == 0 || sample_rate == 0 {
        return Spectral {
            flux: Vec::new(),
            chroma,
        };
    }

    let pitch_class: Vec<Option<usize>> = (0..bins)
        .map(|k| {
            let freq = k as f64 * sample_rate as f64 / FRAME_LEN as f64;
            if !(CHROMA_MIN_HZ..=CHROMA_MAX_HZ).contains(&freq) {
                return None;
            }
            let midi = 69.0 + 12.0 * (freq / 440.0).log2();
            Some((midi.round() as i64).rem_euclid(12) as usize)
        })
        .collect();

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FRAME_LEN);
    let window = hann(FRAME_LEN);
    let half = FRAME_LEN / 2;
    let mut buf = vec![Complex::new(0.0f32, 0.0); FRAME_LEN];
    let mut prev = vec![0.0f32; bins];
    let mut cur = vec![0.0f32; bins];
    let mut flux = Vec::with_capacity(n_frames);

    for t in 0..n_frames {
        let centre = t * hop;
        for (j, slot) in buf.iter_mut().enumerate() {
            let sample = (centre + j)
                .checked_sub(half)
                .and_then(|i| mono.get(i))
                .copied()
                .unwrap_or(0.0);
            *slot = Complex::new(sample * window[j], 0.0);
        }
        fft.process(&mut buf);

        let mut diff = 0.0f32;
        for k in 0..bins {
            let mag = buf[k].norm();
            cur[k] = mag.ln_1p();
            if t > 0 {
                diff += (cur[k] - prev[k]).max(0.0);
            }
            if let Some(pc) = pitch_class[k] {
                chroma[pc] += mag as f64;
            }
        }
        flux.push(diff);
        std::mem::swap(&mut prev, &mut cur);
    }

    Spectral { flux, chroma }
}

/// Light Hann smoothing so onset peaks survive non-integer beat periods.
fn smooth(x: &[f32]) -> Vec<f32> {
    const KERNEL: [f32; 5] = [0.25, 0.75, 1.0, 0.75, 0.25];
    let norm: f32 = KERNEL.iter().sum();
    (0..x.len())
        .map(|i| {
            KERNEL
                .iter()
                .enumerate()
                .filter_map(|(j, &w)| (i + j).checked_sub(2).and_then(|k| x.get(k)).map(|v| v * w))
                .sum::<f32>()
                / norm
        })
        .collect()
}

/// Tempo from the onset autocorrelation, in [MIN_BPM, MAX_BPM].
/// Returns the prior tempo when no periodicity is found.
fn estimate_tempo(onset: &[f32], sample_rate: u32, hop: usize) -> f64 {
    let n = onset.len();
    let frames_per_min = 60.0 * sample_rate as f64 / hop as f64;
    let min_lag = (frames_per_min / MAX_BPM).ceil().max(1.0) as usize;
    let max_lag = (frames_per_min / MIN_BPM).floor() as usize;
    if n <= max_lag + 1 || min_lag >= max_lag {
        return PRIOR_BPM;
    }

    let mean = onset.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let x: Vec<f64> = onset.iter().map(|&v| v as f64 - mean).collect();

    let scores: Vec<f64> = (min_lag..=max_lag)
        .map(|lag| {
            let ac = x.iter().zip(&x[lag..]).map(|(a, b)| a * b).sum::<f64>() / (n - lag) as f64;
            let bpm = frames_per_min / lag as f64;
            let octaves = (bpm / PRIOR_BPM).log2() / PRIOR_OCTAVES;
            ac * (-0.5 * octaves * octaves).exp()
        })
        .collect();

    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    if scores[best] <= 0.0 {
        return PRIOR_BPM;
    }

    // Parabolic interpolation around the peak for sub-frame lag precision.
    let mut lag = (min_lag + best) as f64;
    if best > 0 && best + 1 < scores.len() {
        let (a, b, c) = (scores[best - 1], scores[best], scores[best + 1]);
        let denom = a - 2.0 * b + c;
        if denom < 0.0 {
            lag += (0.5 * (a - c) / denom).clamp(-0.5, 0.5);
        }
    }
    (frames_per_min / lag).clamp(MIN_BPM, MAX_BPM)
}

/// Even beat grid at `bpm`, phase-anchored to the strongest onset alignment.
/// Returned values are onset-frame indices.
fn track_beats(onset: &[f32], bpm: f64, sample_rate: u32, hop: usize) -> Vec<usize> {
    let n = onset.len();
    if n == 0 || bpm <= 0.0 {
        return Vec::new();
    }
    let period = 60.0 * sample_rate as f64 / (hop as f64 * bpm);
    if period < 1.0 {
        return Vec::new();
    }
    let grid = |phase: f64| {
        (0..)
            .map(move |k| (phase + k as f64 * period).round() as usize)
            .take_while(move |&f| f < n)
    };

    let mut best_phase = 0usize;
    let mut best_sum = f32::NEG_INFINITY;
    for phase in 0..(period.ceil() as usize).min(n) {
        let sum: f32 = grid(phase as f64).map(|f| onset[f]).sum();
        if sum > best_sum {
            best_sum = sum;
            best_phase = phase;
        }
    }
    grid(best_phase as f64).collect()
}

/// RMS of centred `FRAME_LEN` windows every `hop` samples.
fn frame_rms(mono: &[f32], hop: usize) -> Vec<f32> {
    let half = FRAME_LEN / 2;
    (0..frame_count(mono.len(), hop))
        .map(|t| {
            let centre = t * hop;
            let lo = centre.saturating_sub(half);
            let hi = (centre + half).min(mono.len());
            if hi <= lo {
                return 0.0;
            }
            let sum: f32 = mono[lo..hi].iter().map(|s| s * s).sum();
            (sum / FRAME_LEN as f32).sqrt()
        })
        .collect()
}

/// Mean of `frames` between consecutive beats; the last beat runs to the end.
fn beat_sync(frames: &[f32], beat_frames: &[usize]) -> Vec<f64> {
    beat_frames
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = beat_frames.get(i + 1).copied().unwrap_or(frames.len());
            let end = end.min(frames.len());
            if start >= end {
                return 0.0;
            }
            frames[start..end].iter().map(|&v| v as f64).sum::<f64>() / (end - start) as f64
        })
        .collect()
}

fn normalize_max(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(0.0f64, f64::max);
    values.iter().map(|v| v / (max + 1e-6)).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Value at `fraction` of the sorted list (floor index).
fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * fraction) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Split the beat grid into phrases and label each by position and energy.
pub fn label_phrases(
    beat_times: &[f64],
    energy: &[f64],
    vocal: &[f64],
    duration: f64,
    cfg: &AnalysisConfig,
) -> Vec<Segment> {
    let pb = cfg.phrase_beats.max(1);
    let starts = phrase_starts(beat_times, pb);
    if starts.is_empty() {
        return Vec::new();
    }

    let slice_mean = |curve: &[f64], i: usize| {
        let lo = (i * pb).min(curve.len());
        let hi = ((i + 1) * pb).min(curve.len());
        mean(&curve[lo..hi])
    };
    let energies: Vec<f64> = (0..starts.len()).map(|i| slice_mean(energy, i)).collect();
    let mut sorted = energies.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let low = percentile(&sorted, cfg.low_energy_percentile);
    let high = percentile(&sorted, cfg.high_energy_percentile);

    starts
        .iter()
        .zip(&energies)
        .enumerate()
        .map(|(i, (&time, &e))| {
            let rel = if duration > 0.0 { time / duration } else { 0.0 };
            let label = if rel < cfg.intro_cutoff && e < high {
                SegmentLabel::Intro
            } else if rel > cfg.outro_cutoff && e < high {
                SegmentLabel::Outro
            } else if e >= high {
                SegmentLabel::Chorus
            } else if e <= low {
                SegmentLabel::Bridge
            } else {
                SegmentLabel::Verse
            };
            Segment {
                time,
                label,
                energy: e,
                vocal_energy: slice_mean(vocal, i),
            }
        })
        .collect()
}

fn pearson(x: &[f64; 12], y: &[f64; 12]) -> f64 {
    let mx = x.iter().sum::<f64>() / 12.0;
    let my = y.iter().sum::<f64>() / 12.0;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return 0.0;
    }
    sxy / (sxx * syy).sqrt()
}

/// Best-correlated major or minor key for a chroma profile ("A Minor").
/// Empty when the profile is flat.
pub fn estimate_key(chroma: &[f64; 12]) -> String {
    if chroma.iter().all(|&c| c <= 0.0) {
        return String::new();
    }
    let mut best: Option<(f64, Key)> = None;
    for root in 0..12u8 {
        let rotated: [f64; 12] = std::array::from_fn(|j| chroma[(j + root as usize) % 12]);
        for (profile, minor) in [(&MAJOR_PROFILE, false), (&MINOR_PROFILE, true)] {
            let corr = pearson(&rotated, profile);
            if best.is_none_or(|(c, _)| corr > c) {
                best = Some((corr, Key::new(root, minor)));
            }
        }
    }
    best.map(|(_, key)| key.to_string()).unwrap_or_default()
}

/// Top-scoring windows by mean beat energy, best first.
pub fn detect_highlights(beat_times: &[f64], energy: &[f64], cfg: &AnalysisConfig) -> Vec<Highlight> {
    let window = cfg.highlight_window_beats.max(1);
    let usable = energy.len().min(beat_times.len());
    if usable < window {
        return vec![Highlight {
            start_time: 0.0,
            end_time: beat_times.last().copied().unwrap_or(0.0),
            score: 0.0,
        }];
    }
    let mut found: Vec<Highlight> = (0..=usable - window)
        .step_by(cfg.highlight_stride_beats.max(1))
        .map(|i| Highlight {
            start_time: beat_times[i],
            end_time: beat_times[i + window - 1],
            score: mean(&energy[i..i + window]),
        })
        .collect();
    found.sort_by(|a, b| b.score.total_cmp(&a.score));
    found.truncate(cfg.highlight_count);
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 22050;

    /// Decaying 2 kHz bursts every beat.
    fn click_track(bpm: f64, secs: f64) -> Vec<f32> {
        let n = (SR as f64 * secs) as usize;
        let mut y = vec![0.0f32; n];
        let period = 60.0 / bpm;
        let burst = (SR as f64 * 0.03) as usize;
        let mut t = 0.25;
        while t < secs {
            let start = (t * SR as f64) as usize;
            for j in 0..burst {
                if let Some(s) = y.get_mut(start + j) {
                    let env = (-(j as f32) / (burst as f32 / 5.0)).exp();
                    *s += env * (2.0 * std::f32::consts::PI * 2000.0 * j as f32 / SR as f32).sin();
                }
            }
            t += period;
        }
        y
    }

    #[test]
    fn test_click_track_tempo_and_grid() {
        let cfg = AnalysisConfig::default();
        let y = click_track(120.0, 30.0);
        let f = extract(&y, SR, &cfg);
        assert!((f.bpm - 120.0).abs() < 4.0, "bpm {}", f.bpm);
        assert!(f.beat_times.len() > 50);
        let spacing = (f.beat_times[f.beat_times.len() - 1] - f.beat_times[0])
            / (f.beat_times.len() - 1) as f64;
        assert!((spacing - 0.5).abs() < 0.02, "spacing {}", spacing);
        assert_eq!(f.energy_curve.len(), f.beat_times.len());
        assert_eq!(f.vocal_curve.len(), f.beat_times.len());
        assert!((f.duration - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_silence_falls_back_to_prior() {
        let cfg = AnalysisConfig::default();
        let f = extract(&vec![0.0; SR as usize * 5], SR, &cfg);
        assert_eq!(f.bpm, PRIOR_BPM);
        assert!(f.key.is_empty());
        assert!(f.energy_curve.iter().all(|&e| e == 0.0));
    }

    #[test]
    fn test_empty_input() {
        let f = extract(&[], SR, &AnalysisConfig::default());
        assert!(f.beat_times.is_empty());
        assert!(f.segments.is_empty());
        assert_eq!(f.highlights.len(), 1);
    }

    #[test]
    fn test_key_from_rotated_profile() {
        // G major: rotate the major profile so its tonic lands on pitch class 7.
        let chroma: [f64; 12] = std::array::from_fn(|pc| MAJOR_PROFILE[(pc + 12 - 7) % 12]);
        assert_eq!(estimate_key(&chroma), "G Major");
        let chroma: [f64; 12] = std::array::from_fn(|pc| MINOR_PROFILE[(pc + 12 - 9) % 12]);
        assert_eq!(estimate_key(&chroma), "A Minor");
    }

    #[test]
    fn test_phrase_labels_by_position_and_energy() {
        let cfg = AnalysisConfig::default();
        // 10 phrases of 32 beats at 0.5 s, duration 160 s.
        let beats: Vec<f64> = (0..320).map(|i| i as f64 * 0.5).collect();
        let phrase_energy = [0.2, 0.5, 0.9, 0.6, 0.1, 0.95, 0.55, 0.85, 0.7, 0.2];
        let energy: Vec<f64> = (0..320).map(|i| phrase_energy[i / 32]).collect();
        let vocal = vec![0.3; 320];
        let segs = label_phrases(&beats, &energy, &vocal, 160.0, &cfg);
        let labels: Vec<SegmentLabel> = segs.iter().map(|s| s.label).collect();
        use SegmentLabel::*;
        assert_eq!(
            labels,
            vec![Intro, Intro, Chorus, Verse, Bridge, Chorus, Verse, Chorus, Verse, Outro]
        );
        assert_eq!(segs[3].time, 48.0);
        assert!((segs[0].vocal_energy - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_highlights_rank_loudest_window() {
        let cfg = AnalysisConfig::default();
        let beats: Vec<f64> = (0..200).map(|i| i as f64 * 0.5).collect();
        let energy: Vec<f64> = (0..200).map(|i| i as f64 / 200.0).collect();
        let hl = detect_highlights(&beats, &energy, &cfg);
        assert_eq!(hl.len(), 3);
        assert!(hl[0].score >= hl[1].score && hl[1].score >= hl[2].score);
        // windows start at 0,16,..,128; the last one scores highest
        assert_eq!(hl[0].start_time, 64.0);
        assert_eq!(hl[0].end_time, beats[128 + 63]);
    }

    #[test]
    fn test_exactly_one_window_of_beats() {
        let cfg = AnalysisConfig::default();
        let beats: Vec<f64> = (0..64).map(|i| i as f64 * 0.5).collect();
        let hl = detect_highlights(&beats, &vec![0.5; 64], &cfg);
        assert_eq!(hl.len(), 1);
        assert_eq!(hl[0].start_time, 0.0);
        assert_eq!(hl[0].end_time, beats[63]);
        assert!((hl[0].score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_last_full_window_is_scored() {
        let cfg = AnalysisConfig::default();
        // 80 beats at 120 BPM; only the window starting at beat 16 is all loud.
        let beats: Vec<f64> = (0..80).map(|i| i as f64 * 0.5).collect();
        let energy: Vec<f64> = (0..80).map(|i| if i < 16 { 0.1 } else { 1.0 }).collect();
        let hl = detect_highlights(&beats, &energy, &cfg);
        assert_eq!(hl.len(), 2);
        assert_eq!(hl[0].start_time, 8.0);
        assert_eq!(hl[0].end_time, beats[79]);
        assert!((hl[0].score - 1.0).abs() < 1e-12);
        assert_eq!(hl[1].start_time, 0.0);
    }

    #[test]
    fn test_short_track_single_highlight() {
        let cfg = AnalysisConfig::default();
        let beats = vec![0.0, 0.5, 1.0];
        let hl = detect_highlights(&beats, &[1.0, 1.0, 1.0], &cfg);
        assert_eq!(hl.len(), 1);
        assert_eq!(hl[0].end_time, 1.0);
    }
}
