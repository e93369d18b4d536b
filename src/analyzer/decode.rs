use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("No audio decoded from {0}")]
    Empty(String),
    #[error("ffmpeg not found, required for formats symphonia cannot read")]
    FfmpegNotFound,
    #[error("ffmpeg error: {0}")]
    Ffmpeg(String),
    #[error("ffmpeg timed out after {0}s")]
    Timeout(u64),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interleaved f32 PCM as it came out of the file.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Vec<f32> {
        let ch = self.channels.max(1) as usize;
        if ch == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }
}

/// Load an audio file with symphonia, falling back to an ffmpeg
/// subprocess for anything symphonia cannot probe or decode.
pub fn load_audio(path: &Path, timeout: Duration) -> Result<DecodedAudio, DecodeError> {
    match load_via_symphonia(path) {
        Ok(audio) => Ok(audio),
        Err(e) => {
            log::debug!(
                "symphonia failed on {} ({}), trying ffmpeg",
                path.display(),
                e
            );
            load_via_ffmpeg(path, timeout)
        }
    }
}

fn load_via_symphonia(path: &Path) -> Result<DecodedAudio, DecodeError> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::UnsupportedFormat(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError::UnsupportedFormat("no audio track".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::UnsupportedFormat(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                log::warn!("Error reading packet from {}: {}", path.display(), e);
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("Skipping bad packet in {}: {}", path.display(), e);
                continue;
            }
            Err(e) => return Err(DecodeError::UnsupportedFormat(e.to_string())),
        };

        let spec = *decoded.spec();
        let needed = decoded.capacity() * spec.channels.count();
        if sample_buf.as_ref().is_none_or(|b| b.capacity() < needed) {
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        if channels == 0 {
            channels = spec.channels.count() as u16;
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    if samples.is_empty() || sample_rate == 0 || channels == 0 {
        return Err(DecodeError::Empty(path.display().to_string()));
    }
    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode by shelling out to ffmpeg into a temporary WAV, then reading it back.
fn load_via_ffmpeg(path: &Path, timeout: Duration) -> Result<DecodedAudio, DecodeError> {
    let tmp = tempfile::Builder::new()
        .prefix("beatstitch-decode-")
        .suffix(".wav")
        .tempfile()?;
    let input = path.to_string_lossy();
    let output = tmp.path().to_string_lossy();
    run_ffmpeg(
        &[
            "-i", &*input, "-f", "wav", "-acodec", "pcm_f32le", "-y", &*output,
        ],
        timeout,
    )?;
    read_wav(tmp.path())
}

/// Read a WAV file (int or float) into interleaved f32.
pub fn read_wav(path: &Path) -> Result<DecodedAudio, DecodeError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };
    if samples.is_empty() {
        return Err(DecodeError::Empty(path.display().to_string()));
    }
    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Run ffmpeg with `args`, killing it if it outlives `timeout`.
pub fn run_ffmpeg(args: &[&str], timeout: Duration) -> Result<(), DecodeError> {
    let mut child = match Command::new("ffmpeg")
        .args(["-hide_banner", "-nostdin", "-loglevel", "error"])
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DecodeError::FfmpegNotFound);
        }
        Err(e) => return Err(e.into()),
    };

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            child.kill().ok();
            child.wait().ok();
            return Err(DecodeError::Timeout(timeout.as_secs()));
        }
        std::thread::sleep(Duration::from_millis(25));
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr).ok();
        }
        return Err(DecodeError::Ffmpeg(stderr.trim().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(path: &Path, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for c in 0..channels {
                let full: i16 = if c == 0 { 16384 } else { -16384 };
                let v = if i % 2 == 0 { full } else { full / 2 };
                w.write_sample(v).unwrap();
            }
        }
        w.finalize().unwrap();
    }

    #[test]
    fn test_read_wav_scales_int_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        write_test_wav(&path, 1, 100);
        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.frames(), 100);
        assert!((audio.samples[0] - 0.5).abs() < 1e-4);
        assert!((audio.samples[1] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_symphonia_decodes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.wav");
        write_test_wav(&path, 2, 4000);
        let audio = load_audio(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.frames(), 4000);
        assert!((audio.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let audio = DecodedAudio {
            samples: vec![1.0, 0.0, 0.5, 0.5],
            sample_rate: 10,
            channels: 2,
        };
        assert_eq!(audio.to_mono(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_garbage_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.xyz");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(load_audio(&path, Duration::from_secs(5)).is_err());
    }
}
