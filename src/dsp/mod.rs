pub mod export;
pub mod filter;
pub mod stretch;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::analyzer::decode::{self, DecodeError, DecodedAudio};
pub use filter::FilterKind;

#[derive(Error, Debug)]
pub enum DspError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to move export into place: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("Stretch error: {0}")]
    Stretch(#[from] stretch::StretchError),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// A time range in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0.0
    }
}

/// Interleaved f32 PCM with its format.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn silence(secs: f64, sample_rate: u32, channels: u16) -> Self {
        let frames = (secs.max(0.0) * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; frames * channels.max(1) as usize], sample_rate, channels)
    }

    pub fn empty_like(&self) -> Self {
        Self::new(Vec::new(), self.sample_rate, self.channels)
    }

    /// Convert decoded file audio to the given rate and channel count.
    pub fn from_decoded(
        audio: DecodedAudio,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, DspError> {
        let src_ch = audio.channels.max(1) as usize;
        let resampled = stretch::resample(&audio.samples, src_ch, audio.sample_rate, sample_rate)?;
        let buf = Self::new(resampled, sample_rate, audio.channels);
        Ok(buf.with_channels(channels))
    }

    /// Remap channels: mono is duplicated, extra channels are averaged down.
    pub fn with_channels(self, channels: u16) -> Self {
        let channels = channels.max(1);
        if channels == self.channels {
            return self;
        }
        let src = self.channels as usize;
        let dst = channels as usize;
        let samples = self
            .samples
            .chunks_exact(src)
            .flat_map(|frame| {
                let mono = frame.iter().sum::<f32>() / src as f32;
                std::iter::repeat_n(mono, dst)
            })
            .collect();
        Self::new(samples, self.sample_rate, channels)
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn secs_to_frames(&self, secs: f64) -> usize {
        (secs.max(0.0) * self.sample_rate as f64).round() as usize
    }

    /// Copy of `[start, end)` seconds, clamped to the buffer.
    pub fn slice_secs(&self, start: f64, end: f64) -> Self {
        let total = self.frames();
        let s = self.secs_to_frames(start).min(total);
        let e = self.secs_to_frames(end).clamp(s, total);
        let ch = self.channels as usize;
        Self::new(self.samples[s * ch..e * ch].to_vec(), self.sample_rate, self.channels)
    }

    pub fn append(&mut self, other: &AudioBuffer) {
        self.samples.extend_from_slice(&other.samples);
    }

    /// Pad with silence or cut to exactly `frames` frames.
    pub fn fit_frames(&mut self, frames: usize) {
        self.samples.resize(frames * self.channels as usize, 0.0);
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    pub fn apply_gain(&mut self, gain: f32) {
        for s in &mut self.samples {
            *s *= gain;
        }
    }

    /// Multiply frame `i` of `n` by `curve(i / n)`.
    pub fn apply_envelope(&mut self, curve: impl Fn(f32) -> f32) {
        let n = self.frames();
        if n == 0 {
            return;
        }
        let ch = self.channels as usize;
        for (i, frame) in self.samples.chunks_exact_mut(ch).enumerate() {
            let g = curve(i as f32 / n as f32);
            for s in frame {
                *s *= g;
            }
        }
    }

    /// Sum `other` into this buffer starting at frame 0, growing if needed.
    pub fn mix_in(&mut self, other: &AudioBuffer) {
        if other.samples.len() > self.samples.len() {
            self.samples.resize(other.samples.len(), 0.0);
        }
        for (d, s) in self.samples.iter_mut().zip(&other.samples) {
            *d += s;
        }
    }

    /// Frames `(lead, trail)` quieter than `threshold_db` at each end.
    pub fn silent_edges(&self, threshold_db: f32) -> (usize, usize) {
        let threshold = 10f32.powf(threshold_db / 20.0);
        let ch = self.channels as usize;
        let loud = |frame: &[f32]| frame.iter().any(|s| s.abs() > threshold);
        let frames: Vec<&[f32]> = self.samples.chunks_exact(ch).collect();
        let lead = frames.iter().position(|f| loud(f)).unwrap_or(frames.len());
        let trail = frames
            .iter()
            .rev()
            .position(|f| loud(f))
            .unwrap_or(frames.len());
        (lead, trail)
    }
}

/// Low-level audio primitives consumed by the renderer.
pub trait SignalProcessor: Send + Sync {
    /// Decode `path`, optionally only `window`, at the processor's output format.
    fn decode(&self, path: &Path, window: Option<TimeWindow>) -> Result<AudioBuffer, DspError>;
    /// Change duration by `1 / rate` keeping pitch.
    fn stretch(&self, buf: &AudioBuffer, rate: f64) -> Result<AudioBuffer, DspError>;
    /// Shift pitch keeping duration.
    fn pitch_shift(&self, buf: &AudioBuffer, semitones: f64) -> Result<AudioBuffer, DspError>;
    fn filter(&self, buf: &AudioBuffer, kind: FilterKind, cutoff_hz: f32) -> Result<AudioBuffer, DspError>;
    fn export(&self, buf: &AudioBuffer, path: &Path, bitrate_kbps: u32) -> Result<(), DspError>;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
}

/// Decoded tracks kept around; a render touches each track in at most two
/// consecutive steps.
const DECODE_CACHE_SIZE: usize = 2;

/// In-process processor: symphonia/ffmpeg decode, rubato resampling,
/// signalsmith-stretch for tempo and key, SVF filters.
pub struct NativeProcessor {
    sample_rate: u32,
    channels: u16,
    timeout: Duration,
    cache: Mutex<Vec<(PathBuf, Arc<AudioBuffer>)>>,
}

impl NativeProcessor {
    pub fn new(sample_rate: u32, channels: u16, timeout: Duration) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            timeout,
            cache: Mutex::new(Vec::with_capacity(DECODE_CACHE_SIZE)),
        }
    }

    fn load_full(&self, path: &Path) -> Result<Arc<AudioBuffer>, DspError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some((_, buf)) = cache.iter().find(|(p, _)| p == path) {
                return Ok(Arc::clone(buf));
            }
        }
        let decoded = decode::load_audio(path, self.timeout)?;
        let buf = Arc::new(AudioBuffer::from_decoded(decoded, self.sample_rate, self.channels)?);
        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= DECODE_CACHE_SIZE {
                cache.remove(0);
            }
            cache.push((path.to_path_buf(), Arc::clone(&buf)));
        }
        Ok(buf)
    }
}

impl SignalProcessor for NativeProcessor {
    fn decode(&self, path: &Path, window: Option<TimeWindow>) -> Result<AudioBuffer, DspError> {
        let full = self.load_full(path)?;
        match window {
            None => Ok((*full).clone()),
            Some(w) => {
                let duration = full.duration_secs();
                if w.start < 0.0 || w.end > duration + 1e-3 {
                    log::debug!(
                        "Clamping window [{:.2}, {:.2}] of {} to [0, {:.2}]",
                        w.start,
                        w.end,
                        path.display(),
                        duration
                    );
                }
                Ok(full.slice_secs(w.start, w.end))
            }
        }
    }

    fn stretch(&self, buf: &AudioBuffer, rate: f64) -> Result<AudioBuffer, DspError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DspError::InvalidArgument(format!("stretch rate {}", rate)));
        }
        let out = stretch::time_stretch(&buf.samples, buf.channels as usize, buf.sample_rate, rate);
        Ok(AudioBuffer::new(out, buf.sample_rate, buf.channels))
    }

    fn pitch_shift(&self, buf: &AudioBuffer, semitones: f64) -> Result<AudioBuffer, DspError> {
        if !semitones.is_finite() {
            return Err(DspError::InvalidArgument(format!("pitch shift {}", semitones)));
        }
        let out = stretch::pitch_shift(&buf.samples, buf.channels as usize, buf.sample_rate, semitones);
        Ok(AudioBuffer::new(out, buf.sample_rate, buf.channels))
    }

    fn filter(&self, buf: &AudioBuffer, kind: FilterKind, cutoff_hz: f32) -> Result<AudioBuffer, DspError> {
        let mut out = buf.clone();
        filter::apply_filter(&mut out.samples, buf.channels as usize, buf.sample_rate, kind, cutoff_hz);
        Ok(out)
    }

    fn export(&self, buf: &AudioBuffer, path: &Path, bitrate_kbps: u32) -> Result<(), DspError> {
        export::export_audio(buf, path, bitrate_kbps, self.timeout)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_clamps() {
        let buf = AudioBuffer::new((0..20).map(|i| i as f32).collect(), 10, 2); // 1 s
        let s = buf.slice_secs(0.5, 5.0);
        assert_eq!(s.frames(), 5);
        assert_eq!(s.samples[0], 10.0);
        assert!(buf.slice_secs(3.0, 4.0).is_empty());
        assert!(buf.slice_secs(0.8, 0.2).is_empty());
    }

    #[test]
    fn test_channel_mapping() {
        let mono = AudioBuffer::new(vec![0.2, 0.4], 10, 1);
        let stereo = mono.with_channels(2);
        assert_eq!(stereo.samples, vec![0.2, 0.2, 0.4, 0.4]);
        let back = stereo.with_channels(1);
        assert_eq!(back.samples, vec![0.2, 0.4]);
    }

    #[test]
    fn test_from_decoded_resamples() {
        let decoded = DecodedAudio {
            samples: vec![0.0; 22050],
            sample_rate: 22050,
            channels: 1,
        };
        let buf = AudioBuffer::from_decoded(decoded, 44100, 2).unwrap();
        assert_eq!(buf.channels, 2);
        assert_eq!(buf.frames(), 44100);
    }

    #[test]
    fn test_silent_edges() {
        let mut samples = vec![0.0; 10];
        samples[3] = 0.5;
        samples[6] = -0.5;
        let buf = AudioBuffer::new(samples, 10, 1);
        assert_eq!(buf.silent_edges(-40.0), (3, 3));
        let quiet = AudioBuffer::silence(1.0, 10, 1);
        assert_eq!(quiet.silent_edges(-40.0), (10, 10));
    }

    #[test]
    fn test_mix_in_grows() {
        let mut a = AudioBuffer::new(vec![1.0, 1.0], 10, 1);
        let b = AudioBuffer::new(vec![0.5, 0.5, 0.5], 10, 1);
        a.mix_in(&b);
        assert_eq!(a.samples, vec![1.5, 1.5, 0.5]);
    }

    #[test]
    fn test_native_decode_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let src = AudioBuffer::new(vec![0.25; 8000 * 2], 8000, 1);
        export::write_wav(&src, &path, export::WavEncoding::Float32).unwrap();

        let dsp = NativeProcessor::new(8000, 2, Duration::from_secs(5));
        let full = dsp.decode(&path, None).unwrap();
        assert_eq!(full.channels, 2);
        assert!((full.duration_secs() - 2.0).abs() < 1e-9);
        let part = dsp.decode(&path, Some(TimeWindow::new(1.5, 9.0))).unwrap();
        assert!((part.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_stretch_rejects_bad_rate() {
        let dsp = NativeProcessor::new(8000, 1, Duration::from_secs(1));
        let buf = AudioBuffer::silence(0.1, 8000, 1);
        assert!(dsp.stretch(&buf, 0.0).is_err());
        assert!(dsp.stretch(&buf, f64::NAN).is_err());
    }
}
