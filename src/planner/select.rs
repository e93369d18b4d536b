//! Candidate scoring and selection.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::PlanError;
use super::candidates::TransitionCandidate;
use crate::config::PlannerConfig;
use crate::weights::PreferenceWeights;

/// The chosen candidate of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Index into the candidate batch.
    pub index: usize,
    /// Score including jitter.
    pub score: f64,
    /// False when the exit sits inside the safety buffer of the previous entry.
    pub feasible: bool,
}

/// Fidelity term: large tempo or pitch corrections score lower.
pub fn accuracy_score(c: &TransitionCandidate) -> f64 {
    let speed_dev = (c.speed_a - 1.0).abs() + (c.speed_b - 1.0).abs();
    1.0 - 2.0 * speed_dev - 0.1 * c.pitch_shift_b.abs() as f64
}

/// Whether the candidate exits at least one buffer after `min_exit`.
pub fn is_feasible(c: &TransitionCandidate, min_exit: Option<f64>, cfg: &PlannerConfig) -> bool {
    match min_exit {
        Some(min) => c.a_out_time >= min + cfg.safety_buffer_secs,
        None => true,
    }
}

/// Deterministic part of the score.
pub fn score_candidate(
    c: &TransitionCandidate,
    weights: &PreferenceWeights,
    min_exit: Option<f64>,
    cfg: &PlannerConfig,
) -> f64 {
    let preference = weights.type_weight(c.kind) * weights.bar_weight(c.bar_length);
    let penalty = if is_feasible(c, min_exit, cfg) {
        0.0
    } else {
        cfg.safety_penalty
    };
    preference * accuracy_score(c) - penalty
}

/// Pick the highest scoring candidate. Jitter in `[0, cfg.jitter)` breaks ties;
/// remaining ties go to the earliest candidate.
pub fn select_best<R: Rng + ?Sized>(
    candidates: &[TransitionCandidate],
    weights: &PreferenceWeights,
    min_exit: Option<f64>,
    cfg: &PlannerConfig,
    rng: &mut R,
) -> Result<Selection, PlanError> {
    let mut best: Option<Selection> = None;
    for (index, c) in candidates.iter().enumerate() {
        let jitter = if cfg.jitter > 0.0 {
            rng.random::<f64>() * cfg.jitter
        } else {
            0.0
        };
        let score = score_candidate(c, weights, min_exit, cfg) + jitter;
        if best.is_none_or(|b| score > b.score) {
            best = Some(Selection {
                index,
                score,
                feasible: is_feasible(c, min_exit, cfg),
            });
        }
    }
    best.ok_or(PlanError::EmptyBatch)
}
