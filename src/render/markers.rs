//! Track-start markers and the LRC file that carries them.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Output offset at which a track becomes audible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub offset_ms: u64,
    pub label: String,
}

impl Marker {
    pub fn at_frame(frame: usize, sample_rate: u32, label: impl Into<String>) -> Self {
        let offset_ms = if sample_rate == 0 {
            0
        } else {
            (frame as u64 * 1000) / sample_rate as u64
        };
        Self {
            offset_ms,
            label: label.into(),
        }
    }
}

/// `[MM:SS.CC]` for an offset in milliseconds.
pub fn format_timestamp(offset_ms: u64) -> String {
    let minutes = offset_ms / 60_000;
    let centis = (offset_ms % 60_000) / 10;
    format!("[{:02}:{:02}.{:02}]", minutes, centis / 100, centis % 100)
}

/// Full LRC text: a fixed header, a blank line, then one line per marker.
pub fn to_lrc(markers: &[Marker], title: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("[ar:{}]\n", crate::APP_NAME));
    out.push_str(&format!("[ti:{}]\n", title));
    out.push_str("[al:Auto Mix]\n");
    out.push_str(&format!("[by:{}]\n", crate::APP_NAME));
    out.push('\n');
    for m in markers {
        out.push_str(&format_timestamp(m.offset_ms));
        out.push(' ');
        out.push_str(&m.label);
        out.push('\n');
    }
    out
}

/// Marker file path paired with an audio artifact (same stem).
pub fn lrc_path(audio: &Path) -> PathBuf {
    audio.with_extension("lrc")
}

/// Write the LRC into a temp file beside `dest`; the caller persists it.
pub fn stage_lrc(markers: &[Marker], title: &str, dest: &Path) -> std::io::Result<NamedTempFile> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".beatstitch-lrc-")
        .tempfile_in(dir)?;
    tmp.write_all(to_lrc(markers, title).as_bytes())?;
    tmp.flush()?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "[00:00.00]");
        assert_eq!(format_timestamp(65_430), "[01:05.43]");
        assert_eq!(format_timestamp(59_999), "[00:59.99]");
        assert_eq!(format_timestamp(3_600_000), "[60:00.00]");
    }

    #[test]
    fn test_marker_from_frame() {
        assert_eq!(Marker::at_frame(66150, 44100, "x").offset_ms, 1500);
        assert_eq!(Marker::at_frame(10, 0, "x").offset_ms, 0);
    }

    #[test]
    fn test_lrc_layout() {
        let markers = vec![
            Marker {
                offset_ms: 0,
                label: "Artist - First".to_string(),
            },
            Marker {
                offset_ms: 125_500,
                label: "Second".to_string(),
            },
        ];
        let text = to_lrc(&markers, "mix");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[ar:beatstitch]");
        assert_eq!(lines[1], "[ti:mix]");
        assert_eq!(lines[4], "");
        assert_eq!(lines[5], "[00:00.00] Artist - First");
        assert_eq!(lines[6], "[02:05.50] Second");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn test_lrc_path_shares_stem() {
        assert_eq!(lrc_path(Path::new("/out/set.mp3")), PathBuf::from("/out/set.lrc"));
    }

    #[test]
    fn test_stage_then_persist() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("set.lrc");
        let staged = stage_lrc(&[], "set", &dest).unwrap();
        assert!(!dest.exists());
        staged.persist(&dest).unwrap();
        assert!(std::fs::read_to_string(&dest).unwrap().starts_with("[ar:"));
    }
}
