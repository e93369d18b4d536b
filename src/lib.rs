pub mod analyzer;
pub mod config;
pub mod db;
pub mod dsp;
pub mod grid;
pub mod key;
pub mod planner;
pub mod render;
pub mod sequencer;
pub mod track;
pub mod weights;

/// Audio file extensions we support
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "wav",
    // Native (symphonia)
    "aif", "aiff", "m4a", "aac",
    // ffmpeg fallback
    "opus", "wv", "wma",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "beatstitch";
