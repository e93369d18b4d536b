use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid analysis JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Structural label of a 32-beat phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SegmentLabel {
    Intro,
    Verse,
    Chorus,
    Bridge,
    Outro,
}

impl SegmentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intro => "Intro",
            Self::Verse => "Verse",
            Self::Chorus => "Chorus",
            Self::Bridge => "Bridge",
            Self::Outro => "Outro",
        }
    }

    /// Labels that peak late in their phrase, so the exit sits deeper inside.
    pub fn is_chorus_like(&self) -> bool {
        matches!(self, Self::Chorus)
    }
}

impl fmt::Display for SegmentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One phrase of a track. Segments of a track are ordered and never overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub time: f64,
    pub label: SegmentLabel,
    pub energy: f64,
    #[serde(default)]
    pub vocal_energy: f64,
}

/// A scored high-energy window of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub start_time: f64,
    pub end_time: f64,
    pub score: f64,
}

/// Everything the planner and renderer know about one track.
///
/// Produced by the feature extractor and immutable afterwards, except for the
/// user-supplied `manual_in` / `manual_out` boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackAnalysis {
    pub path: PathBuf,
    /// SHA-256 of the source bytes (hex). Empty for hand-built analyses.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub name: String,
    pub duration: f64,
    pub bpm: f64,
    #[serde(default)]
    pub loudness_db: f64,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub beat_times: Vec<f64>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub energy_curve: Vec<f64>,
    #[serde(default)]
    pub vocal_curve: Vec<f64>,
    #[serde(default)]
    pub highlights: Vec<Highlight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_out: Option<f64>,
}

impl TrackAnalysis {
    /// Mean of the energy curve; 0.5 when the curve is empty.
    pub fn mean_energy(&self) -> f64 {
        if self.energy_curve.is_empty() {
            0.5
        } else {
            self.energy_curve.iter().sum::<f64>() / self.energy_curve.len() as f64
        }
    }

    /// Seconds per beat at the track's native tempo.
    pub fn seconds_per_beat(&self) -> f64 {
        if self.bpm > 0.0 { 60.0 / self.bpm } else { 0.5 }
    }

    /// Name shown in the marker file.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        file_stem(&self.path)
    }

    /// Clamp a time point into `[0, duration]`.
    pub fn clamp_time(&self, t: f64) -> f64 {
        let clamped = t.clamp(0.0, self.duration.max(0.0));
        if (clamped - t).abs() > 1e-9 {
            log::debug!(
                "Clamped {:.3}s into [0, {:.3}] for {}",
                t,
                self.duration,
                self.path.display()
            );
        }
        clamped
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("?")
        .to_string()
}

/// Derive a display name: tag artist/title when present, else a cleaned filename stem.
pub fn derive_display_name(path: &Path) -> String {
    if let Some(name) = tag_display_name(path) {
        return name;
    }
    clean_stem(&file_stem(path))
}

fn tag_display_name(path: &Path) -> Option<String> {
    use lofty::file::TaggedFileExt;
    use lofty::tag::Accessor;

    let tagged = lofty::read_from_path(path).ok()?;
    let tag = tagged.primary_tag().or_else(|| tagged.first_tag())?;
    let title = tag.title()?.trim().to_string();
    if title.is_empty() {
        return None;
    }
    match tag.artist() {
        Some(artist) if !artist.trim().is_empty() => Some(format!("{} - {}", artist.trim(), title)),
        _ => Some(title),
    }
}

/// Strip leading track numbers ("01 - ", "07. ") and underscores from a filename stem.
fn clean_stem(stem: &str) -> String {
    use std::sync::LazyLock;
    static TRACK_NO: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"^\s*\d{1,3}\s*[-._)]\s*").unwrap());

    let stripped = TRACK_NO.replace(stem, "");
    let cleaned = stripped.replace('_', " ").trim().to_string();
    if cleaned.is_empty() {
        stem.to_string()
    } else {
        cleaned
    }
}

/// Load one analysis from a JSON file.
pub fn load_analysis(path: &Path) -> Result<TrackAnalysis, TrackError> {
    let contents = std::fs::read_to_string(path).map_err(|source| TrackError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| TrackError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write one analysis as pretty JSON.
pub fn save_analysis(analysis: &TrackAnalysis, path: &Path) -> Result<(), TrackError> {
    let json = serde_json::to_string_pretty(analysis).map_err(|source| TrackError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| TrackError::Io {
        path: path.to_path_buf(),
        source,
    })
}
