use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// Every section has defaults, so the config file is optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Custom analysis cache path (overrides XDG default).
    pub cache_db: Option<PathBuf>,
    /// Custom preference weights path (overrides XDG default).
    pub weights_path: Option<PathBuf>,
    /// Base random seed. Unset = fresh entropy per run.
    pub seed: Option<u64>,
    pub planner: PlannerConfig,
    pub analysis: AnalysisConfig,
    pub render: RenderConfig,
}

/// Tuning constants for candidate generation and selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Candidates generated per track pair.
    pub candidates_per_pair: usize,
    /// Force a scenario count instead of the adaptive 3..=5.
    pub scenarios: Option<usize>,
    /// Tempo gap (BPM) below which both tracks are synced to the mean.
    pub sync_threshold_bpm: f64,
    /// Minimum seconds between the previous entry and the next exit.
    pub safety_buffer_secs: f64,
    pub safety_penalty: f64,
    /// Upper bound of the uniform tie-break jitter.
    pub jitter: f64,
    /// Probability that an Outro->Intro pairing is kept.
    pub outro_intro_acceptance: f64,
    pub pairing_retries: usize,
    /// Pitch correction probability for |shift| <= 2.
    pub pitch_prob_small: f64,
    /// Pitch correction probability for |shift| in 3..=4.
    pub pitch_prob_medium: f64,
    /// Pitch correction probability for |shift| >= 5.
    pub pitch_prob_large: f64,
    pub max_pitch_shift: i32,
    pub mashup_min_secs: f64,
    pub mashup_min_bars: u32,
    /// Beats per structural phrase when locating an exit peak.
    pub phrase_beats: usize,
    /// Bars stepped forward from a phrase energy peak.
    pub exit_step_bars: u32,
    pub heuristic_grid_beats: usize,
    pub manual_grid_beats: usize,
    pub chorus_exit_fraction: f64,
    pub other_exit_fraction: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            candidates_per_pair: 8,
            scenarios: None,
            sync_threshold_bpm: 20.0,
            safety_buffer_secs: 4.0,
            safety_penalty: 500.0,
            jitter: 0.01,
            outro_intro_acceptance: 0.05,
            pairing_retries: 10,
            pitch_prob_small: 1.0,
            pitch_prob_medium: 0.5,
            pitch_prob_large: 0.2,
            max_pitch_shift: 2,
            mashup_min_secs: 15.0,
            mashup_min_bars: 8,
            phrase_beats: 32,
            exit_step_bars: 6,
            heuristic_grid_beats: 16,
            manual_grid_beats: 4,
            chorus_exit_fraction: 0.85,
            other_exit_fraction: 0.70,
        }
    }
}

/// Feature extractor constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub sample_rate: u32,
    pub hop_length: usize,
    pub phrase_beats: usize,
    /// Relative position below which a quiet phrase is an Intro.
    pub intro_cutoff: f64,
    /// Relative position above which a quiet phrase is an Outro.
    pub outro_cutoff: f64,
    pub low_energy_percentile: f64,
    pub high_energy_percentile: f64,
    pub highlight_window_beats: usize,
    pub highlight_stride_beats: usize,
    pub highlight_count: usize,
    pub vocal_low_hz: f32,
    pub vocal_high_hz: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            hop_length: 512,
            phrase_beats: 32,
            intro_cutoff: 0.15,
            outro_cutoff: 0.85,
            low_energy_percentile: 0.30,
            high_energy_percentile: 0.70,
            highlight_window_beats: 64,
            highlight_stride_beats: 16,
            highlight_count: 3,
            vocal_low_hz: 300.0,
            vocal_high_hz: 3000.0,
        }
    }
}

/// Renderer and export constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_kbps: u32,
    pub tail_fade_secs: f64,
    /// Peak level the finished mix is normalised to (linear).
    pub target_peak: f32,
    /// Largest gain normalisation may apply.
    pub max_boost: f32,
    pub silence_threshold_db: f32,
    pub highpass_hz: f32,
    pub lowpass_hz: f32,
    pub mashup_gain_a_db: f32,
    pub mashup_gain_b_db: f32,
    /// Seconds of context either side of the zone in previews.
    pub preview_margin_secs: f64,
    /// Timeout for external tool calls (ffmpeg).
    pub dsp_timeout_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            bitrate_kbps: 320,
            tail_fade_secs: 3.0,
            target_peak: 0.89,
            max_boost: 2.0,
            silence_threshold_db: -40.0,
            highpass_hz: 300.0,
            lowpass_hz: 400.0,
            mashup_gain_a_db: -1.0,
            mashup_gain_b_db: 1.0,
            preview_margin_secs: 10.0,
            dsp_timeout_secs: 120,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/beatstitch/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::from_toml(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Cache path: config override, else XDG data dir.
    pub fn resolve_cache_db(&self) -> PathBuf {
        self.cache_db
            .clone()
            .unwrap_or_else(|| data_file("analysis-cache.db"))
    }

    /// Weights path: config override, else XDG data dir.
    pub fn resolve_weights_path(&self) -> PathBuf {
        self.weights_path
            .clone()
            .unwrap_or_else(|| data_file("weights.json"))
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

fn data_file(name: &str) -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join(name)
    } else {
        // Fallback: current directory
        PathBuf::from(name)
    }
}
