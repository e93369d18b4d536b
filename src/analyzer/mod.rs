pub mod decode;
pub mod features;

use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::AnalysisConfig;
use crate::db::{Database, hash_file};
use crate::dsp::stretch::{StretchError, resample};
use crate::track::{TrackAnalysis, derive_display_name};
use crate::SUPPORTED_EXTENSIONS;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Decode error: {0}")]
    Decode(#[from] decode::DecodeError),
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("Cannot hash {path}: {source}")]
    Hash {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Resampling error: {0}")]
    Resample(#[from] StretchError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Outcome of a batch analysis. `tracks` keeps the input order of the
/// files that succeeded.
pub struct AnalyzeResult {
    pub tracks: Vec<TrackAnalysis>,
    pub analyzed: u64,
    pub cached: u64,
    pub failed: Vec<(PathBuf, String)>,
}

/// Expand files and directories into the supported audio files beneath them,
/// sorted within each directory.
pub fn collect_audio_files(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
            continue;
        }
        let mut found: Vec<PathBuf> = WalkDir::new(input)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_supported(p))
            .collect();
        found.sort();
        files.extend(found);
    }
    files
}

fn is_supported(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

/// Decode and analyse one file, without touching the cache.
pub fn analyze_file(
    path: &Path,
    cfg: &AnalysisConfig,
    timeout: Duration,
) -> Result<TrackAnalysis, AnalyzeError> {
    let hash = hash_file(path).map_err(|source| AnalyzeError::Hash {
        path: path.to_path_buf(),
        source,
    })?;
    analyze_decoded(path, hash, cfg, timeout)
}

fn analyze_decoded(
    path: &Path,
    hash: String,
    cfg: &AnalysisConfig,
    timeout: Duration,
) -> Result<TrackAnalysis, AnalyzeError> {
    log::debug!(
        "Analyzing: {}",
        path.file_name().and_then(|f| f.to_str()).unwrap_or("?")
    );
    let audio = decode::load_audio(path, timeout)?;
    let mono = resample(&audio.to_mono(), 1, audio.sample_rate, cfg.sample_rate)?;
    let f = features::extract(&mono, cfg.sample_rate, cfg);

    Ok(TrackAnalysis {
        path: path.to_path_buf(),
        hash,
        name: derive_display_name(path),
        duration: audio.duration_secs(),
        bpm: f.bpm,
        loudness_db: f.loudness_db,
        key: f.key,
        beat_times: f.beat_times,
        segments: f.segments,
        energy_curve: f.energy_curve,
        vocal_curve: f.vocal_curve,
        highlights: f.highlights,
        manual_in: None,
        manual_out: None,
    })
}

/// Analyse `paths` in parallel, reusing cached results for byte-identical
/// audio. Failed files are reported and skipped; the batch continues.
///
/// Cache misses are processed in chunks: analyse a chunk in parallel, write
/// it to the cache, then move on, so an interrupted batch keeps its progress.
pub fn analyze_tracks(
    paths: &[PathBuf],
    db: Option<&Database>,
    cfg: &AnalysisConfig,
    timeout: Duration,
    force: bool,
    jobs: usize,
) -> std::result::Result<AnalyzeResult, AnalyzeError> {
    use rayon::prelude::*;

    let jobs = jobs.max(1);
    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;

    let hashes: Vec<std::io::Result<String>> =
        pool.install(|| paths.par_iter().map(|p| hash_file(p)).collect());

    let mut slots: Vec<Option<TrackAnalysis>> = vec![None; paths.len()];
    let mut failed = Vec::new();
    let mut todo: Vec<(usize, String)> = Vec::new();
    let mut cached: u64 = 0;

    for (i, hash) in hashes.into_iter().enumerate() {
        let path = &paths[i];
        let hash = match hash {
            Ok(h) => h,
            Err(e) => {
                log::warn!("Cannot read {}: {}", path.display(), e);
                failed.push((path.clone(), e.to_string()));
                continue;
            }
        };
        let hit = match db {
            Some(db) if !force => db.get_analysis(&hash).unwrap_or_else(|e| {
                log::warn!("Ignoring cache entry for {}: {}", path.display(), e);
                None
            }),
            _ => None,
        };
        match hit {
            Some(mut analysis) => {
                log::debug!("Cache hit for {}", path.display());
                analysis.path = path.clone();
                slots[i] = Some(analysis);
                cached += 1;
            }
            None => todo.push((i, hash)),
        }
    }

    if todo.is_empty() {
        log::info!("No tracks to analyze ({} cached)", cached);
    } else {
        log::info!("Analyzing {} tracks with {} workers", todo.len(), jobs);
    }

    let pb = ProgressBar::new(todo.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let mut analyzed: u64 = 0;
    for chunk in todo.chunks(jobs * 2) {
        let results: Vec<_> = pool.install(|| {
            chunk
                .par_iter()
                .map(|(i, hash)| {
                    let result = analyze_decoded(&paths[*i], hash.clone(), cfg, timeout);
                    pb.inc(1);
                    (*i, result)
                })
                .collect()
        });

        for (i, result) in results {
            match result {
                Ok(analysis) => {
                    if let Some(db) = db {
                        if let Err(e) = db.store_analysis(&analysis) {
                            log::error!(
                                "DB error caching analysis for {}: {}",
                                paths[i].display(),
                                e
                            );
                        }
                    }
                    slots[i] = Some(analysis);
                    analyzed += 1;
                }
                Err(e) => {
                    log::warn!("Analysis failed for {}: {}", paths[i].display(), e);
                    failed.push((paths[i].clone(), e.to_string()));
                }
            }
        }
        pb.set_message(format!("{} analyzed, {} failed", analyzed, failed.len()));
    }

    pb.finish_with_message(format!(
        "Done: {} analyzed, {} cached, {} failed",
        analyzed,
        cached,
        failed.len()
    ));

    Ok(AnalyzeResult {
        tracks: slots.into_iter().flatten().collect(),
        analyzed,
        cached,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_click_wav(path: &Path, secs: f32) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(path, spec).unwrap();
        let n = (22050.0 * secs) as usize;
        for i in 0..n {
            // short click every half second
            let v: i16 = if i % 11025 < 200 { 12000 } else { 0 };
            w.write_sample(v).unwrap();
            w.write_sample(v).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn test_collect_audio_files_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("a.WAV"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let files = collect_audio_files(&[dir.path().to_path_buf()]);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.WAV", "b.mp3"]);
    }

    #[test]
    fn test_batch_caches_and_skips_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.wav");
        let copy = dir.path().join("copy.wav");
        let bad = dir.path().join("bad.wav");
        write_click_wav(&good, 4.0);
        std::fs::copy(&good, &copy).unwrap();
        std::fs::write(&bad, b"not audio at all").unwrap();

        let db = Database::open_in_memory().unwrap();
        let cfg = AnalysisConfig::default();
        let timeout = Duration::from_secs(5);
        let paths = vec![good.clone(), bad.clone()];
        let first = analyze_tracks(&paths, Some(&db), &cfg, timeout, false, 2).unwrap();
        assert_eq!(first.analyzed, 1);
        assert_eq!(first.cached, 0);
        assert_eq!(first.failed.len(), 1);
        assert_eq!(first.failed[0].0, bad);
        assert_eq!(first.tracks.len(), 1);
        assert!((first.tracks[0].duration - 4.0).abs() < 1e-6);

        // byte-identical copy is served from the cache under its own path
        let second = analyze_tracks(&[copy.clone()], Some(&db), &cfg, timeout, false, 2).unwrap();
        assert_eq!(second.analyzed, 0);
        assert_eq!(second.cached, 1);
        assert_eq!(second.tracks[0].path, copy);
        assert_eq!(second.tracks[0].hash, first.tracks[0].hash);
        assert_eq!(second.tracks[0].beat_times, first.tracks[0].beat_times);
    }

    #[test]
    fn test_force_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.wav");
        write_click_wav(&good, 2.0);
        let db = Database::open_in_memory().unwrap();
        let cfg = AnalysisConfig::default();
        let timeout = Duration::from_secs(5);
        analyze_tracks(&[good.clone()], Some(&db), &cfg, timeout, false, 1).unwrap();
        let again = analyze_tracks(&[good], Some(&db), &cfg, timeout, true, 1).unwrap();
        assert_eq!(again.analyzed, 1);
        assert_eq!(again.cached, 0);
    }
}
