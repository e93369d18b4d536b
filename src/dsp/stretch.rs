//! Sample-rate conversion, time-stretch and pitch-shift on interleaved f32 PCM.
//!
//! Rate conversion runs through rubato's FFT resampler. Stretching and
//! transposition run through signalsmith-stretch, fed in fixed-size output
//! chunks with the stretcher's latency trimmed off the front.

use rubato::{FftFixedIn, Resampler};
use signalsmith_stretch::Stretch;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StretchError {
    #[error("Cannot build resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),
    #[error("Resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
}

/// Input frames handed to the resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

/// Output frames requested from the stretcher per call.
const STRETCH_CHUNK: usize = 256;

fn deinterleave(samples: &[f32], ch: usize) -> Vec<Vec<f32>> {
    let mut planar = vec![Vec::with_capacity(samples.len() / ch); ch];
    for frame in samples.chunks_exact(ch) {
        for (c, &s) in frame.iter().enumerate() {
            planar[c].push(s);
        }
    }
    planar
}

fn append_planar(out: &mut [Vec<f32>], produced: Vec<Vec<f32>>) {
    for (dst, src) in out.iter_mut().zip(produced) {
        dst.extend_from_slice(&src);
    }
}

/// Convert between sample rates. The output holds exactly
/// `round(frames * to / from)` frames, aligned with the input.
pub fn resample(
    samples: &[f32],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>, StretchError> {
    let ch = channels.max(1);
    let in_frames = samples.len() / ch;
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || in_frames == 0 {
        return Ok(samples[..in_frames * ch].to_vec());
    }
    let out_frames = (in_frames as f64 * to_rate as f64 / from_rate as f64).round() as usize;

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, ch)?;
    let delay = resampler.output_delay();
    let planar = deinterleave(samples, ch);
    let mut out: Vec<Vec<f32>> =
        vec![Vec::with_capacity(out_frames + delay + RESAMPLE_CHUNK); ch];

    let mut pos = 0;
    while pos < in_frames {
        let need = resampler.input_frames_next();
        let end = (pos + need).min(in_frames);
        let block: Vec<&[f32]> = planar.iter().map(|c| &c[pos..end]).collect();
        let produced = if end - pos == need {
            resampler.process(block.as_slice(), None)?
        } else {
            resampler.process_partial(Some(block.as_slice()), None)?
        };
        append_planar(&mut out, produced);
        pos = end;
    }
    // Drain the filter tail until the delayed output covers the whole input.
    while out[0].len() < out_frames + delay {
        let produced = resampler.process_partial(None::<&[&[f32]]>, None)?;
        if produced.first().is_none_or(|c| c.is_empty()) {
            break;
        }
        append_planar(&mut out, produced);
    }

    let mut interleaved = Vec::with_capacity(out_frames * ch);
    for i in delay..delay + out_frames {
        for c in &out {
            interleaved.push(c.get(i).copied().unwrap_or(0.0));
        }
    }
    Ok(interleaved)
}

/// Feed `samples` through `stretcher` at `rate` input frames per output
/// frame, returning `round(frames / rate)` latency-compensated frames.
fn run_stretcher(mut stretcher: Stretch, samples: &[f32], ch: usize, rate: f64) -> Vec<f32> {
    let in_frames = samples.len() / ch;
    let out_frames = (in_frames as f64 / rate).round() as usize;
    let in_latency = stretcher.input_latency();
    let delay = (in_latency as f64 / rate).round() as usize + stretcher.output_latency();

    // Trailing silence pushes the last real input through the input latency.
    let padded_frames = in_frames + in_latency;
    let mut padded = Vec::with_capacity(padded_frames * ch);
    padded.extend_from_slice(&samples[..in_frames * ch]);
    padded.resize(padded_frames * ch, 0.0);

    let total = out_frames + delay;
    let mut out = vec![0.0f32; total * ch];
    let mut in_pos = 0usize;
    let mut out_pos = 0usize;
    let mut fractional = 0.0f64;

    while out_pos < total && in_pos < padded_frames {
        let out_len = STRETCH_CHUNK.min(total - out_pos);
        fractional += out_len as f64 * rate;
        let in_len = fractional.floor() as usize;
        fractional -= in_len as f64;

        let in_end = (in_pos + in_len).min(padded_frames);
        if in_end == in_pos {
            break;
        }
        stretcher.process(
            &padded[in_pos * ch..in_end * ch],
            &mut out[out_pos * ch..(out_pos + out_len) * ch],
        );
        in_pos = in_end;
        out_pos += out_len;
    }
    if out_pos < total {
        stretcher.flush(&mut out[out_pos * ch..]);
    }

    out.drain(..delay.min(total) * ch);
    out.resize(out_frames * ch, 0.0);
    out
}

/// Change duration by `1 / rate` without changing pitch. `rate > 1` plays faster.
pub fn time_stretch(samples: &[f32], channels: usize, sample_rate: u32, rate: f64) -> Vec<f32> {
    let ch = channels.max(1);
    let in_frames = samples.len() / ch;
    if in_frames == 0 || rate <= 0.0 || (rate - 1.0).abs() < 1e-6 {
        return samples[..in_frames * ch].to_vec();
    }
    let stretcher = Stretch::preset_default(ch as u32, sample_rate);
    run_stretcher(stretcher, samples, ch, rate)
}

/// Transpose by `semitones` keeping duration.
pub fn pitch_shift(samples: &[f32], channels: usize, sample_rate: u32, semitones: f64) -> Vec<f32> {
    let ch = channels.max(1);
    let in_frames = samples.len() / ch;
    if semitones.abs() < 1e-6 || in_frames == 0 {
        return samples[..in_frames * ch].to_vec();
    }
    let mut stretcher = Stretch::preset_default(ch as u32, sample_rate);
    stretcher.set_transpose_factor_semitones(semitones as f32, None);
    run_stretcher(stretcher, samples, ch, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, sr: u32, secs: f32, ch: usize) -> Vec<f32> {
        let n = (sr as f32 * secs) as usize;
        let mut v = Vec::with_capacity(n * ch);
        for i in 0..n {
            let s = (2.0 * PI * freq * i as f32 / sr as f32).sin() * 0.5;
            for _ in 0..ch {
                v.push(s);
            }
        }
        v
    }

    /// Middle 80% of the first channel.
    fn body(samples: &[f32], ch: usize) -> Vec<f32> {
        let mono: Vec<f32> = samples.iter().step_by(ch).copied().collect();
        let skip = mono.len() / 10;
        mono[skip..mono.len() - skip].to_vec()
    }

    /// Zero crossings per second of the first channel, ignoring the edges.
    fn crossing_rate(samples: &[f32], ch: usize, sr: u32) -> f32 {
        let body = body(samples, ch);
        let crossings = body
            .windows(2)
            .filter(|w| (w[0] <= 0.0) != (w[1] <= 0.0))
            .count();
        crossings as f32 / (body.len() as f32 / sr as f32)
    }

    fn rms(samples: &[f32], ch: usize) -> f32 {
        let body = body(samples, ch);
        (body.iter().map(|s| s * s).sum::<f32>() / body.len() as f32).sqrt()
    }

    #[test]
    fn test_resample_length() {
        let x = sine(100.0, 44100, 1.0, 2);
        let y = resample(&x, 2, 44100, 22050).unwrap();
        assert_eq!(y.len(), 22050 * 2);
        assert_eq!(resample(&x, 2, 44100, 44100).unwrap().len(), x.len());
        let up = resample(&x, 2, 44100, 48000).unwrap();
        assert_eq!(up.len(), 48000 * 2);
    }

    #[test]
    fn test_resample_keeps_passband() {
        let x = sine(440.0, 44100, 1.0, 1);
        let y = resample(&x, 1, 44100, 22050).unwrap();
        let ratio = rms(&y, 1) / rms(&x, 1);
        assert!((ratio - 1.0).abs() < 0.05, "rms ratio {}", ratio);
        let f = crossing_rate(&y, 1, 22050) / 2.0;
        assert!((f - 440.0).abs() < 5.0, "freq {}", f);
    }

    #[test]
    fn test_downsample_rejects_content_above_new_nyquist() {
        // 15 kHz cannot exist at 22.05 kHz; it must be filtered, not folded to 7.05 kHz.
        let x = sine(15000.0, 44100, 1.0, 1);
        let y = resample(&x, 1, 44100, 22050).unwrap();
        assert_eq!(y.len(), 22050);
        assert!(rms(&y, 1) < 0.02 * rms(&x, 1), "leaked rms {}", rms(&y, 1));
    }

    #[test]
    fn test_stretch_changes_length_not_pitch() {
        let sr = 22050;
        let x = sine(440.0, sr, 2.0, 1);
        for rate in [0.9, 1.1] {
            let y = time_stretch(&x, 1, sr, rate);
            let expected = (x.len() as f64 / rate).round() as usize;
            assert_eq!(y.len(), expected);
            let f_in = crossing_rate(&x, 1, sr);
            let f_out = crossing_rate(&y, 1, sr);
            assert!((f_out / f_in - 1.0).abs() < 0.05, "rate {} {} vs {}", rate, f_out, f_in);
        }
    }

    #[test]
    fn test_stretch_unity_is_identity() {
        let x = sine(220.0, 8000, 0.5, 2);
        assert_eq!(time_stretch(&x, 2, 8000, 1.0), x);
    }

    #[test]
    fn test_pitch_shift_keeps_length_moves_pitch() {
        let sr = 22050;
        let x = sine(330.0, sr, 2.0, 2);
        let y = pitch_shift(&x, 2, sr, 2.0);
        assert_eq!(y.len(), x.len());
        let ratio = crossing_rate(&y, 2, sr) / crossing_rate(&x, 2, sr);
        let expected = 2f32.powf(2.0 / 12.0);
        assert!((ratio - expected).abs() < 0.05, "ratio {}", ratio);
    }

    #[test]
    fn test_short_input_keeps_length() {
        let x = sine(440.0, 44100, 0.02, 1);
        let y = time_stretch(&x, 1, 44100, 2.0);
        assert_eq!(y.len(), (x.len() as f64 / 2.0).round() as usize);
    }
}
