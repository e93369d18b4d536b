use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeightsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to replace weights file: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("Unknown transition type '{0}'")]
    UnknownType(String),
    #[error("Weight must be a finite non-negative number, got {0}")]
    InvalidWeight(f64),
}

/// How two tracks are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    Crossfade,
    BassSwap,
    Cut,
    FilterFade,
    Mashup,
}

impl TransitionType {
    pub const ALL: [TransitionType; 5] = [
        Self::Crossfade,
        Self::BassSwap,
        Self::Cut,
        Self::FilterFade,
        Self::Mashup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crossfade => "crossfade",
            Self::BassSwap => "bass_swap",
            Self::Cut => "cut",
            Self::FilterFade => "filter_fade",
            Self::Mashup => "mashup",
        }
    }
}

impl fmt::Display for TransitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TransitionType {
    type Err = WeightsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == norm)
            .ok_or_else(|| WeightsError::UnknownType(s.to_string()))
    }
}

/// User preference weights for transition types and bar lengths.
///
/// Read at plan start; written only by an explicit save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceWeights {
    pub types: BTreeMap<TransitionType, f64>,
    pub bars: BTreeMap<u32, f64>,
}

impl Default for PreferenceWeights {
    fn default() -> Self {
        let types = BTreeMap::from([
            (TransitionType::Crossfade, 0.5),
            (TransitionType::BassSwap, 1.6),
            (TransitionType::Cut, 1.2),
            (TransitionType::FilterFade, 1.0),
            (TransitionType::Mashup, 1.0),
        ]);
        let bars = BTreeMap::from([(4, 1.2), (8, 1.5)]);
        Self { types, bars }
    }
}

/// On-disk shape. Type names stay strings so unknown entries can be skipped.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoredWeights {
    types: BTreeMap<String, f64>,
    bars: BTreeMap<String, f64>,
}

impl PreferenceWeights {
    /// Weight of a type; 1.0 when absent.
    pub fn type_weight(&self, t: TransitionType) -> f64 {
        self.types.get(&t).copied().unwrap_or(1.0)
    }

    /// Weight of a bar length; 1.0 when absent.
    pub fn bar_weight(&self, bars: u32) -> f64 {
        self.bars.get(&bars).copied().unwrap_or(1.0)
    }

    /// Weighted draw of a transition type.
    pub fn draw_type<R: Rng + ?Sized>(&self, rng: &mut R) -> TransitionType {
        weighted_pick(&self.types, rng).unwrap_or(TransitionType::Crossfade)
    }

    /// Weighted draw of a bar length.
    pub fn draw_bars<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        weighted_pick(&self.bars, rng).unwrap_or(4)
    }

    pub fn set_type(&mut self, t: TransitionType, weight: f64) -> Result<(), WeightsError> {
        self.types.insert(t, check_weight(weight)?);
        Ok(())
    }

    pub fn set_bars(&mut self, bars: u32, weight: f64) -> Result<(), WeightsError> {
        self.bars.insert(bars, check_weight(weight)?);
        Ok(())
    }

    /// Load weights from `path`, falling back to defaults for anything missing.
    ///
    /// A missing file yields the defaults. Entries with unknown names or
    /// unusable values are skipped with a warning.
    pub fn load(path: &Path) -> Result<Self, WeightsError> {
        if !path.exists() {
            log::debug!("No weights file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&contents)?)
    }

    /// Like [`load`](Self::load) but never fails: errors log and return defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(w) => w,
            Err(e) => {
                log::warn!(
                    "Could not load weights from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let stored: StoredWeights = serde_json::from_str(contents)?;
        let mut weights = Self::default();
        for (name, w) in stored.types {
            match (name.parse::<TransitionType>(), check_weight(w)) {
                (Ok(t), Ok(w)) => {
                    weights.types.insert(t, w);
                }
                _ => log::warn!("Ignoring type weight {}={}", name, w),
            }
        }
        for (bars, w) in stored.bars {
            match (bars.trim().parse::<u32>(), check_weight(w)) {
                (Ok(b), Ok(w)) if b > 0 => {
                    weights.bars.insert(b, w);
                }
                _ => log::warn!("Ignoring bar weight {}={}", bars, w),
            }
        }
        Ok(weights)
    }

    /// Save as JSON via a temp file in the same directory, renamed into place.
    pub fn save(&self, path: &Path) -> Result<(), WeightsError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)?;
        log::info!("Saved weights to {}", path.display());
        Ok(())
    }
}

fn check_weight(w: f64) -> Result<f64, WeightsError> {
    if w.is_finite() && w >= 0.0 {
        Ok(w)
    } else {
        Err(WeightsError::InvalidWeight(w))
    }
}

/// Draw a key with probability proportional to its weight.
/// Iterates in key order, so a seeded rng gives a reproducible draw. When no
/// weight is positive the first key is returned.
fn weighted_pick<K: Copy + Ord, R: Rng + ?Sized>(
    weights: &BTreeMap<K, f64>,
    rng: &mut R,
) -> Option<K> {
    let keys: Vec<K> = weights.keys().copied().collect();
    match WeightedIndex::new(weights.values().copied()) {
        Ok(dist) => keys.get(dist.sample(rng)).copied(),
        Err(e) => {
            log::debug!("No usable weights ({}), taking the first entry", e);
            keys.first().copied()
        }
    }
}
