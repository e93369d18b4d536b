pub mod candidates;
pub mod select;

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PlannerConfig;
use crate::track::TrackAnalysis;
use crate::weights::PreferenceWeights;
use candidates::{TransitionCandidate, generate_candidates};
use select::{Selection, select_best};

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Need at least 2 tracks to plan a mix, got {0}")]
    TooFewTracks(usize),
    #[error("No candidates to select from")]
    EmptyBatch,
    #[error("No feasible transition for pair {pair}")]
    NoFeasibleCandidate { pair: usize },
    #[error("Pair {pair} selects candidate {index} but has only {candidates}")]
    InvalidSelection {
        pair: usize,
        index: usize,
        candidates: usize,
    },
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything one planning run reads: the ordered playlist, the weights
/// snapshot taken at plan start, tuning constants and the base seed.
#[derive(Debug, Clone)]
pub struct MixSession {
    pub tracks: Vec<TrackAnalysis>,
    pub weights: PreferenceWeights,
    pub config: PlannerConfig,
    pub seed: u64,
}

/// Planned transition for one adjacent pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairPlan {
    pub candidates: Vec<TransitionCandidate>,
    pub selection: Selection,
}

impl PairPlan {
    /// The selected candidate. Plans read through [`MixPlan::load`] always
    /// carry an in-range selection.
    pub fn chosen(&self) -> &TransitionCandidate {
        &self.candidates[self.selection.index]
    }
}

/// A complete plan, ready to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixPlan {
    pub tracks: Vec<TrackAnalysis>,
    pub pairs: Vec<PairPlan>,
    /// Pair indices with no feasible candidate. Those pairs still carry
    /// their best-ranked candidate.
    pub failures: Vec<usize>,
    pub score: f64,
    pub scenario: usize,
    pub scenarios: usize,
    pub seed: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl MixPlan {
    pub fn transitions(&self) -> Vec<TransitionCandidate> {
        self.pairs.iter().map(|p| p.chosen().clone()).collect()
    }

    pub fn failure_errors(&self) -> Vec<PlanError> {
        self.failures
            .iter()
            .map(|&pair| PlanError::NoFeasibleCandidate { pair })
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<(), PlanError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let contents = std::fs::read_to_string(path)?;
        let plan: MixPlan = serde_json::from_str(&contents)?;
        for (pair, p) in plan.pairs.iter().enumerate() {
            if p.selection.index >= p.candidates.len() {
                return Err(PlanError::InvalidSelection {
                    pair,
                    index: p.selection.index,
                    candidates: p.candidates.len(),
                });
            }
        }
        if plan.pairs.len() + 1 != plan.tracks.len() {
            log::warn!(
                "Plan {} has {} tracks but {} transitions",
                path.display(),
                plan.tracks.len(),
                plan.pairs.len()
            );
        }
        Ok(plan)
    }

    pub fn track_paths(&self) -> Vec<PathBuf> {
        self.tracks.iter().map(|t| t.path.clone()).collect()
    }
}

/// Result of one greedy pass over the playlist.
#[derive(Debug, Clone)]
struct Scenario {
    index: usize,
    pairs: Vec<PairPlan>,
    failures: Vec<usize>,
    score: f64,
}

/// Adaptive scenario count: 3..=5, growing with playlist length.
pub fn scenario_count(pairs: usize, cfg: &PlannerConfig) -> usize {
    cfg.scenarios
        .unwrap_or_else(|| (pairs + 1).clamp(3, 5))
        .max(1)
}

/// Per-scenario seed, so each scenario draws independently and
/// reproducibly whatever thread runs it.
fn scenario_seed(base: u64, index: usize) -> u64 {
    base ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn run_scenario(session: &MixSession, index: usize) -> Result<Scenario, PlanError> {
    let mut rng = StdRng::seed_from_u64(scenario_seed(session.seed, index));
    let cfg = &session.config;
    let mut pairs = Vec::with_capacity(session.tracks.len().saturating_sub(1));
    let mut failures = Vec::new();
    let mut score = 0.0;
    // Entry time into the current track chosen by the previous transition.
    let mut min_exit = 0.0;

    for (pair, w) in session.tracks.windows(2).enumerate() {
        let (a, b) = (&w[0], &w[1]);
        let cands = generate_candidates(
            a,
            b,
            cfg.candidates_per_pair.max(1),
            &session.weights,
            cfg,
            &mut rng,
        );
        let selection = select_best(&cands, &session.weights, Some(min_exit), cfg, &mut rng)?;
        let chosen = &cands[selection.index];
        if selection.feasible {
            score += session.weights.type_weight(chosen.kind);
        } else {
            log::warn!(
                "Scenario {}: no feasible transition {} -> {} (exit {:.2}s before entry {:.2}s + {:.0}s buffer)",
                index,
                a.display_name(),
                b.display_name(),
                chosen.a_out_time,
                min_exit,
                cfg.safety_buffer_secs
            );
            failures.push(pair);
        }
        min_exit = chosen.b_in_time;
        pairs.push(PairPlan {
            candidates: cands,
            selection,
        });
    }

    Ok(Scenario {
        index,
        pairs,
        failures,
        score,
    })
}

/// Plan transitions for the whole playlist.
///
/// Runs the scenarios in parallel on `jobs` threads and keeps the one with
/// the highest score; equal scores keep the lowest scenario index.
pub fn plan_mix(session: &MixSession, jobs: usize) -> Result<MixPlan, PlanError> {
    let n = session.tracks.len();
    if n < 2 {
        return Err(PlanError::TooFewTracks(n));
    }
    let m = scenario_count(n - 1, &session.config);
    log::info!(
        "Planning {} transitions across {} scenarios (seed {})",
        n - 1,
        m,
        session.seed
    );

    let pb = ProgressBar::new(m as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} scenarios {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()?;
    let scenarios: Vec<Scenario> = pool.install(|| {
        use rayon::prelude::*;
        (0..m)
            .into_par_iter()
            .map(|i| {
                let s = run_scenario(session, i);
                pb.inc(1);
                s
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    let best = scenarios
        .into_iter()
        .reduce(|best, s| {
            if s.score > best.score || (s.score == best.score && s.index < best.index) {
                s
            } else {
                best
            }
        })
        .ok_or(PlanError::EmptyBatch)?;
    pb.finish_with_message(format!("best: #{} ({:.2})", best.index, best.score));

    for &pair in &best.failures {
        log::warn!("{}", PlanError::NoFeasibleCandidate { pair });
    }

    Ok(MixPlan {
        tracks: session.tracks.clone(),
        pairs: best.pairs,
        failures: best.failures,
        score: best.score,
        scenario: best.index,
        scenarios: m,
        seed: session.seed,
        created_at: chrono::Utc::now(),
    })
}
