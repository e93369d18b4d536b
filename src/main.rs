use anyhow::{Context, Result};
use beatstitch::analyzer::{analyze_tracks, collect_audio_files};
use beatstitch::config::AppConfig;
use beatstitch::db::Database;
use beatstitch::dsp::NativeProcessor;
use beatstitch::planner::{MixPlan, MixSession, plan_mix};
use beatstitch::render::Renderer;
use beatstitch::track::{TrackAnalysis, load_analysis, save_analysis};
use beatstitch::weights::{PreferenceWeights, TransitionType};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "beatstitch", version, about = "Beat-matched DJ mix planner and renderer")]
struct Cli {
    /// Path to the analysis cache database
    #[arg(long, global = true)]
    cache_db: Option<PathBuf>,

    /// Path to the preference weights file
    #[arg(long, global = true)]
    weights: Option<PathBuf>,

    /// Number of parallel workers (0 = auto-detect from config)
    #[arg(short = 'j', long, default_value = "0", global = true)]
    jobs: usize,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that take a playlist.
#[derive(clap::Args)]
struct PlaylistArgs {
    /// Audio files, directories, or analysis JSON files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Manual boundaries as PATH=IN:OUT (seconds; either side may be empty)
    #[arg(long = "manual", value_name = "PATH=IN:OUT")]
    manual: Vec<String>,

    /// Keep the input order instead of sequencing by key, tempo and energy
    #[arg(long)]
    keep_order: bool,

    /// Re-analyze even when a cached analysis exists
    #[arg(long)]
    force: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum PreviewFormat {
    Wav,
    Mp3,
}

impl PreviewFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze audio files (tempo, beats, key, structure) into the cache
    Analyze {
        /// Audio files or directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Force re-analysis of cached tracks
        #[arg(long)]
        force: bool,

        /// Also write one editable JSON analysis per track here
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Drop every cached analysis before starting
        #[arg(long)]
        clear_cache: bool,
    },

    /// Order tracks for harmonic, tempo and energy flow
    Sequence {
        #[command(flatten)]
        playlist: PlaylistArgs,
    },

    /// Plan transitions for a playlist and save the plan as JSON
    Plan {
        #[command(flatten)]
        playlist: PlaylistArgs,

        /// Random seed (defaults to config seed, else fresh entropy)
        #[arg(long)]
        seed: Option<u64>,

        /// Where to write the plan
        #[arg(short, long, default_value = "mix_plan.json")]
        output: PathBuf,
    },

    /// Render a saved plan to one audio file plus its .lrc marker file
    Render {
        /// Plan JSON written by `plan`
        plan: PathBuf,

        /// Output audio file (.mp3 or .wav)
        #[arg(short, long, default_value = "mix.mp3")]
        output: PathBuf,
    },

    /// Render a short preview of every planned transition
    Preview {
        /// Plan JSON written by `plan`
        plan: PathBuf,

        /// Directory for the preview files
        #[arg(short, long, default_value = "previews")]
        out_dir: PathBuf,

        #[arg(long, value_enum, default_value = "mp3")]
        format: PreviewFormat,
    },

    /// Analyze, sequence, plan and render in one go
    Mix {
        #[command(flatten)]
        playlist: PlaylistArgs,

        /// Random seed (defaults to config seed, else fresh entropy)
        #[arg(long)]
        seed: Option<u64>,

        /// Output audio file (.mp3 or .wav)
        #[arg(short, long, default_value = "mix.mp3")]
        output: PathBuf,

        /// Also save the plan here
        #[arg(long)]
        plan_out: Option<PathBuf>,
    },

    /// Show or edit transition preference weights
    Weights {
        #[command(subcommand)]
        action: WeightsAction,
    },
}

#[derive(Subcommand)]
enum WeightsAction {
    /// Print the current weights
    Show,
    /// Restore the default weights
    Reset,
    /// Set a type weight (e.g. `bass_swap 1.4`) or a bar weight (e.g. `8 1.5`)
    Set { name: String, weight: f64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();
    let workers = if cli.jobs > 0 { cli.jobs } else { config.resolve_workers() };
    let weights_path = cli.weights.clone().unwrap_or_else(|| config.resolve_weights_path());
    let cache_path = cli.cache_db.clone().unwrap_or_else(|| config.resolve_cache_db());

    match cli.command {
        Commands::Analyze { inputs, force, out_dir, clear_cache } => {
            let db = open_cache(&cache_path)?;
            if clear_cache {
                let removed = db.clear().context("Failed to clear cache")?;
                println!("Cleared {} cached analyses", removed);
            }
            let files = collect_audio_files(&inputs);
            if files.is_empty() {
                anyhow::bail!("No supported audio files found in the given inputs.");
            }
            let result = analyze_tracks(
                &files,
                Some(&db),
                &config.analysis,
                dsp_timeout(&config),
                force,
                workers,
            )
            .context("Analysis failed")?;

            if let Some(dir) = out_dir {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Cannot create {}", dir.display()))?;
                for t in &result.tracks {
                    let stem = t.path.file_stem().and_then(|s| s.to_str()).unwrap_or("track");
                    let path = dir.join(format!("{}.json", stem));
                    save_analysis(t, &path)
                        .with_context(|| format!("Cannot write {}", path.display()))?;
                }
            }

            println!(
                "Analysis complete: {} analyzed, {} cached, {} failed",
                result.analyzed,
                result.cached,
                result.failed.len()
            );
            print_failures(&result.failed);
            println!();
            print_track_table(&result.tracks);
        }

        Commands::Sequence { playlist } => {
            let tracks = load_playlist(&playlist, &config, &cache_path, workers)?;
            let order = beatstitch::sequencer::sequence(&tracks);
            let ordered: Vec<TrackAnalysis> = order.iter().map(|&i| tracks[i].clone()).collect();
            println!(
                "Sequenced {} tracks (flow score {:.1}):",
                ordered.len(),
                beatstitch::sequencer::chain_score(&tracks, &order)
            );
            println!();
            print_track_table(&ordered);
        }

        Commands::Plan { playlist, seed, output } => {
            let tracks = ordered_playlist(&playlist, &config, &cache_path, workers)?;
            let plan = plan_playlist(tracks, &config, &weights_path, seed, workers)?;
            plan.save(&output)
                .with_context(|| format!("Cannot write plan to {}", output.display()))?;
            print_plan(&plan);
            println!();
            println!("Plan saved to {}", output.display());
        }

        Commands::Render { plan, output } => {
            let plan = MixPlan::load(&plan)
                .with_context(|| format!("Cannot load plan {}", plan.display()))?;
            render_plan(&plan, &config, &output)?;
        }

        Commands::Preview { plan, out_dir, format } => {
            let plan = MixPlan::load(&plan)
                .with_context(|| format!("Cannot load plan {}", plan.display()))?;
            let dsp = native_processor(&config);
            let renderer = Renderer::new(&dsp, &config.render);
            let result = renderer
                .write_previews(
                    &plan.tracks,
                    &plan.transitions(),
                    &out_dir,
                    format.extension(),
                    workers,
                )
                .context("Preview rendering failed")?;
            println!(
                "Previews complete: {} written, {} failed",
                result.written.len(),
                result.failed.len()
            );
            for path in &result.written {
                println!("  {}", path.display());
            }
            for (pair, err) in &result.failed {
                println!("  pair {}: {}", pair + 1, err);
            }
        }

        Commands::Mix { playlist, seed, output, plan_out } => {
            let tracks = ordered_playlist(&playlist, &config, &cache_path, workers)?;
            let plan = plan_playlist(tracks, &config, &weights_path, seed, workers)?;
            if let Some(path) = plan_out {
                plan.save(&path)
                    .with_context(|| format!("Cannot write plan to {}", path.display()))?;
            }
            print_plan(&plan);
            println!();
            render_plan(&plan, &config, &output)?;
        }

        Commands::Weights { action } => {
            let weights = apply_weights_action(&weights_path, action)?;
            println!("Weights ({}):", weights_path.display());
            print_weights(&weights);
        }
    }

    Ok(())
}

fn dsp_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.render.dsp_timeout_secs)
}

fn native_processor(config: &AppConfig) -> NativeProcessor {
    NativeProcessor::new(
        config.render.sample_rate,
        config.render.channels,
        dsp_timeout(config),
    )
}

fn open_cache(path: &Path) -> Result<Database> {
    log::info!("Analysis cache: {}", path.display());
    Database::open(path).context("Failed to open analysis cache")
}

/// An input is either a saved analysis or audio that goes through the cache.
enum Input {
    Loaded(TrackAnalysis),
    Audio(PathBuf),
}

fn is_analysis_json(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Resolve the playlist inputs to analyses, in input order. Audio that fails
/// to analyse is reported and left out.
fn load_playlist(
    args: &PlaylistArgs,
    config: &AppConfig,
    cache_path: &Path,
    workers: usize,
) -> Result<Vec<TrackAnalysis>> {
    let mut inputs = Vec::new();
    let mut audio = Vec::new();
    for input in &args.inputs {
        if is_analysis_json(input) {
            let t = load_analysis(input)
                .with_context(|| format!("Cannot load analysis {}", input.display()))?;
            inputs.push(Input::Loaded(t));
        } else {
            for path in collect_audio_files(std::slice::from_ref(input)) {
                audio.push(path.clone());
                inputs.push(Input::Audio(path));
            }
        }
    }

    let mut analyzed: HashMap<PathBuf, TrackAnalysis> = HashMap::new();
    if !audio.is_empty() {
        let db = open_cache(cache_path)?;
        let result = analyze_tracks(
            &audio,
            Some(&db),
            &config.analysis,
            dsp_timeout(config),
            args.force,
            workers,
        )
        .context("Analysis failed")?;
        if !result.failed.is_empty() {
            println!("{} track(s) could not be analyzed and were skipped:", result.failed.len());
            print_failures(&result.failed);
        }
        analyzed = result
            .tracks
            .into_iter()
            .map(|t| (t.path.clone(), t))
            .collect();
    }

    let mut tracks: Vec<TrackAnalysis> = inputs
        .into_iter()
        .filter_map(|input| match input {
            Input::Loaded(t) => Some(t),
            Input::Audio(path) => analyzed.remove(&path),
        })
        .collect();

    for entry in &args.manual {
        let (path, bounds) = parse_manual(entry)?;
        let mut matched = 0;
        for t in tracks
            .iter_mut()
            .filter(|t| t.path == path || t.path.ends_with(&path))
        {
            if bounds.0.is_some() {
                t.manual_in = bounds.0;
            }
            if bounds.1.is_some() {
                t.manual_out = bounds.1;
            }
            matched += 1;
        }
        if matched == 0 {
            log::warn!("--manual {} matched no track", entry);
        }
    }

    if tracks.is_empty() {
        anyhow::bail!("No usable tracks in the given inputs.");
    }
    Ok(tracks)
}

/// The playlist in mix order: sequenced unless `--keep-order`.
fn ordered_playlist(
    args: &PlaylistArgs,
    config: &AppConfig,
    cache_path: &Path,
    workers: usize,
) -> Result<Vec<TrackAnalysis>> {
    let tracks = load_playlist(args, config, cache_path, workers)?;
    if args.keep_order {
        return Ok(tracks);
    }
    let order = beatstitch::sequencer::sequence(&tracks);
    Ok(order.into_iter().map(|i| tracks[i].clone()).collect())
}

/// Parse `PATH=IN:OUT`. The split is on the last `=` so paths may contain one.
fn parse_manual(arg: &str) -> Result<(PathBuf, (Option<f64>, Option<f64>))> {
    let (path, range) = arg
        .rsplit_once('=')
        .with_context(|| format!("Invalid --manual '{}': expected PATH=IN:OUT", arg))?;
    let (start, end) = range
        .split_once(':')
        .with_context(|| format!("Invalid --manual '{}': expected IN:OUT", arg))?;
    let parse = |s: &str| -> Result<Option<f64>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        let v: f64 = s
            .parse()
            .with_context(|| format!("Invalid time '{}' in --manual '{}'", s, arg))?;
        if !v.is_finite() || v < 0.0 {
            anyhow::bail!("Time '{}' in --manual '{}' must be a non-negative number", s, arg);
        }
        Ok(Some(v))
    };
    let bounds = (parse(start)?, parse(end)?);
    if let (Some(a), Some(b)) = bounds {
        if a >= b {
            anyhow::bail!("--manual '{}': IN must be before OUT", arg);
        }
    }
    Ok((PathBuf::from(path), bounds))
}

fn plan_playlist(
    tracks: Vec<TrackAnalysis>,
    config: &AppConfig,
    weights_path: &Path,
    seed: Option<u64>,
    workers: usize,
) -> Result<MixPlan> {
    let seed = seed.or(config.seed).unwrap_or_else(rand::random);
    let session = MixSession {
        tracks,
        weights: PreferenceWeights::load_or_default(weights_path),
        config: config.planner.clone(),
        seed,
    };
    plan_mix(&session, workers).context("Planning failed")
}

fn render_plan(plan: &MixPlan, config: &AppConfig, output: &Path) -> Result<()> {
    let dsp = native_processor(config);
    let renderer = Renderer::new(&dsp, &config.render);
    let cancel = AtomicBool::new(false);
    let mix = renderer
        .render(&plan.tracks, &plan.transitions(), &cancel)
        .context("Render failed")?;
    let lrc = renderer
        .write(&mix, output)
        .with_context(|| format!("Cannot write mix to {}", output.display()))?;
    println!(
        "Render complete: {:.1} min, {} tracks, {} silent fallback(s)",
        mix.audio.duration_secs() / 60.0,
        plan.tracks.len(),
        mix.timeline.fallbacks()
    );
    println!("  {}", output.display());
    println!("  {}", lrc.display());
    Ok(())
}

/// Run a `weights` subcommand against the store at `path`. Reset never reads
/// the old file; the other actions fall back to defaults when it is unreadable.
fn apply_weights_action(path: &Path, action: WeightsAction) -> Result<PreferenceWeights> {
    let weights = match action {
        WeightsAction::Show => PreferenceWeights::load_or_default(path),
        WeightsAction::Reset => {
            let weights = PreferenceWeights::default();
            weights.save(path).context("Failed to save weights")?;
            weights
        }
        WeightsAction::Set { name, weight } => {
            let mut weights = PreferenceWeights::load_or_default(path);
            match name.trim().parse::<u32>() {
                Ok(bars) if bars > 0 => weights.set_bars(bars, weight)?,
                _ => weights.set_type(name.parse()?, weight)?,
            }
            weights.save(path).context("Failed to save weights")?;
            weights
        }
    };
    Ok(weights)
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let head: String = s.chars().take(width - 3).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

fn print_failures(failed: &[(PathBuf, String)]) {
    for (path, err) in failed {
        println!("  {}: {}", path.display(), err);
    }
}

/// Print a table of analyzed tracks.
fn print_track_table(tracks: &[TrackAnalysis]) {
    println!(
        "{:>3}  {:<40} {:>6} {:<10} {:>5} {:>6}",
        "#", "Track", "BPM", "Key", "Min", "Energy"
    );
    println!("{}", "-".repeat(77));
    for (i, t) in tracks.iter().enumerate() {
        println!(
            "{:>3}  {:<40} {:>6.1} {:<10} {:>5.1} {:>6.2}",
            i + 1,
            truncate(&t.display_name(), 40),
            t.bpm,
            if t.key.is_empty() { "?" } else { t.key.as_str() },
            t.duration / 60.0,
            t.mean_energy(),
        );
    }
}

/// Print the chosen transition for every pair.
fn print_plan(plan: &MixPlan) {
    println!(
        "Plan: {} tracks, score {:.2} (scenario {} of {}, seed {})",
        plan.tracks.len(),
        plan.score,
        plan.scenario + 1,
        plan.scenarios,
        plan.seed
    );
    println!();
    println!(
        "{:>3}  {:<28} {:<28} {:<11} {:>4} {:>7} {:>7} {:>5} {:>4}",
        "#", "From", "To", "Type", "Bars", "Out", "In", "Spd", "Pit"
    );
    println!("{}", "-".repeat(105));
    for (i, pair) in plan.pairs.iter().enumerate() {
        let t = pair.chosen();
        let flag = if plan.failures.contains(&i) { " !" } else { "" };
        println!(
            "{:>3}  {:<28} {:<28} {:<11} {:>4} {:>7.1} {:>7.1} {:>5.3} {:>+4}{}",
            i + 1,
            truncate(&plan.tracks[i].display_name(), 28),
            truncate(&plan.tracks[i + 1].display_name(), 28),
            t.kind,
            t.bar_length,
            t.a_out_time,
            t.b_in_time,
            t.speed_b,
            t.pitch_shift_b,
            flag,
        );
    }
    if !plan.failures.is_empty() {
        println!();
        println!("! = no feasible transition; the best-ranked candidate was kept");
    }
}

fn print_weights(weights: &PreferenceWeights) {
    println!("  Types:");
    for t in TransitionType::ALL {
        println!("    {:<12} {:.2}", t, weights.type_weight(t));
    }
    println!("  Bars:");
    for (bars, w) in &weights.bars {
        println!("    {:<12} {:.2}", bars, w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_reset_replaces_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        std::fs::write(&path, "{not json").unwrap();

        let weights = apply_weights_action(&path, WeightsAction::Reset).unwrap();
        assert_eq!(weights, PreferenceWeights::default());
        assert_eq!(PreferenceWeights::load(&path).unwrap(), PreferenceWeights::default());
    }

    #[test]
    fn test_weights_show_and_set_tolerate_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        std::fs::write(&path, "{not json").unwrap();

        let shown = apply_weights_action(&path, WeightsAction::Show).unwrap();
        assert_eq!(shown, PreferenceWeights::default());

        let set = WeightsAction::Set {
            name: "mashup".to_string(),
            weight: 2.0,
        };
        let weights = apply_weights_action(&path, set).unwrap();
        assert_eq!(weights.types[&TransitionType::Mashup], 2.0);
        assert_eq!(PreferenceWeights::load(&path).unwrap(), weights);

        let bars = WeightsAction::Set {
            name: "16".to_string(),
            weight: 0.5,
        };
        let weights = apply_weights_action(&path, bars).unwrap();
        assert_eq!(weights.bars[&16], 0.5);
        assert_eq!(weights.types[&TransitionType::Mashup], 2.0);
    }

    #[test]
    fn test_parse_manual_both_bounds() {
        let (path, (a, b)) = parse_manual("/music/a=b.mp3=12.5:200").unwrap();
        assert_eq!(path, PathBuf::from("/music/a=b.mp3"));
        assert_eq!(a, Some(12.5));
        assert_eq!(b, Some(200.0));
    }

    #[test]
    fn test_parse_manual_open_side() {
        let (_, (a, b)) = parse_manual("song.flac=:95").unwrap();
        assert_eq!(a, None);
        assert_eq!(b, Some(95.0));
    }

    #[test]
    fn test_parse_manual_rejects_bad_input() {
        assert!(parse_manual("song.flac").is_err());
        assert!(parse_manual("song.flac=10").is_err());
        assert!(parse_manual("song.flac=30:10").is_err());
        assert!(parse_manual("song.flac=x:10").is_err());
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 8), "ééééé...");
    }
}
