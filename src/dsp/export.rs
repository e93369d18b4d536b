//! Writing finished audio to disk.
//!
//! Every export goes to a temporary file next to the destination and is
//! renamed into place only once complete, so a failed or abandoned export
//! never leaves a partial file at the destination path.

use std::path::Path;
use std::time::Duration;

use super::{AudioBuffer, DspError};
use crate::analyzer::decode::run_ffmpeg;

/// Sample encoding for WAV output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavEncoding {
    Pcm16,
    Float32,
}

/// Write a WAV file directly (no temp file).
pub fn write_wav(buf: &AudioBuffer, path: &Path, encoding: WavEncoding) -> Result<(), DspError> {
    let spec = hound::WavSpec {
        channels: buf.channels,
        sample_rate: buf.sample_rate,
        bits_per_sample: match encoding {
            WavEncoding::Pcm16 => 16,
            WavEncoding::Float32 => 32,
        },
        sample_format: match encoding {
            WavEncoding::Pcm16 => hound::SampleFormat::Int,
            WavEncoding::Float32 => hound::SampleFormat::Float,
        },
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    match encoding {
        WavEncoding::Pcm16 => {
            for &s in &buf.samples {
                writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
            }
        }
        WavEncoding::Float32 => {
            for &s in &buf.samples {
                writer.write_sample(s)?;
            }
        }
    }
    writer.finalize()?;
    Ok(())
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Export `buf` to `path`. WAV is written natively; every other extension
/// is encoded by ffmpeg at `bitrate_kbps` (MP3 through libmp3lame).
pub fn export_audio(
    buf: &AudioBuffer,
    path: &Path,
    bitrate_kbps: u32,
    timeout: Duration,
) -> Result<(), DspError> {
    if buf.is_empty() {
        return Err(DspError::InvalidArgument("nothing to export".to_string()));
    }
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let ext = extension(path);
    let staged = tempfile::Builder::new()
        .prefix(".beatstitch-export-")
        .suffix(&format!(".{}", if ext.is_empty() { "wav" } else { ext.as_str() }))
        .tempfile_in(dir)?;

    if ext == "wav" || ext.is_empty() {
        write_wav(buf, staged.path(), WavEncoding::Pcm16)?;
    } else {
        let pcm = tempfile::Builder::new()
            .prefix("beatstitch-pcm-")
            .suffix(".wav")
            .tempfile()?;
        write_wav(buf, pcm.path(), WavEncoding::Float32)?;

        let input = pcm.path().to_string_lossy();
        let output = staged.path().to_string_lossy();
        let bitrate = format!("{}k", bitrate_kbps);
        let mut args: Vec<&str> = vec!["-i", &*input];
        if ext == "mp3" {
            args.extend(["-codec:a", "libmp3lame"]);
        }
        args.extend(["-b:a", bitrate.as_str(), "-y", &*output]);
        run_ffmpeg(&args, timeout)?;
    }

    staged.persist(path)?;
    log::info!(
        "Exported {:.1}s of audio to {}",
        buf.duration_secs(),
        path.display()
    );
    Ok(())
}
