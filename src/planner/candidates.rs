//! Candidate generation for one ordered track pair.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::PlannerConfig;
use crate::grid::{bars_to_seconds, beats_in_window, snap_to_grid};
use crate::key::shift_toward;
use crate::track::{Segment, SegmentLabel, TrackAnalysis};
use crate::weights::{PreferenceWeights, TransitionType};

const EXIT_LABELS: [SegmentLabel; 4] = [
    SegmentLabel::Chorus,
    SegmentLabel::Verse,
    SegmentLabel::Bridge,
    SegmentLabel::Outro,
];
const ENTRY_LABELS: [SegmentLabel; 4] = [
    SegmentLabel::Intro,
    SegmentLabel::Verse,
    SegmentLabel::Chorus,
    SegmentLabel::Bridge,
];

/// Filter applied inside the transition zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    /// High-pass on the outgoing track.
    HighPass,
    /// Low-pass on the outgoing track.
    LowPass,
    /// High-pass on the incoming track so its vocals sit above A's low end.
    MashupSplit,
}

impl FilterType {
    pub fn for_type(t: TransitionType) -> Option<Self> {
        match t {
            TransitionType::BassSwap => Some(Self::HighPass),
            TransitionType::FilterFade => Some(Self::LowPass),
            TransitionType::Mashup => Some(Self::MashupSplit),
            TransitionType::Crossfade | TransitionType::Cut => None,
        }
    }
}

/// One proposed way of joining track A into track B.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionCandidate {
    #[serde(rename = "type")]
    pub kind: TransitionType,
    pub bar_length: u32,
    /// Exit time in A (seconds). The zone ends here.
    pub a_out_time: f64,
    /// Entry time in B (seconds). The zone starts here.
    pub b_in_time: f64,
    pub speed_a: f64,
    pub speed_b: f64,
    pub pitch_shift_b: i32,
    pub filter: Option<FilterType>,
    pub duration_seconds: f64,
    pub feature_tags: Vec<String>,
}

/// Tempo sync: both tracks move to the mean BPM when the gap is under threshold.
pub fn sync_speeds(bpm_a: f64, bpm_b: f64, threshold: f64) -> (f64, f64) {
    if bpm_a <= 0.0 || bpm_b <= 0.0 || (bpm_a - bpm_b).abs() >= threshold {
        return (1.0, 1.0);
    }
    let target = (bpm_a + bpm_b) / 2.0;
    (target / bpm_a, target / bpm_b)
}

fn target_bpm(a: &TrackAnalysis, b: &TrackAnalysis, threshold: f64) -> f64 {
    if a.bpm > 0.0 && b.bpm > 0.0 && (a.bpm - b.bpm).abs() < threshold {
        (a.bpm + b.bpm) / 2.0
    } else if a.bpm > 0.0 {
        a.bpm
    } else {
        120.0
    }
}

/// Apply the harmonic shift with graduated probability, then clamp.
pub fn choose_pitch<R: Rng + ?Sized>(shift: i32, cfg: &PlannerConfig, rng: &mut R) -> i32 {
    let p = match shift.abs() {
        0..=2 => cfg.pitch_prob_small,
        3..=4 => cfg.pitch_prob_medium,
        _ => cfg.pitch_prob_large,
    };
    let applied = if p >= 1.0 {
        shift
    } else if p > 0.0 && rng.random_bool(p) {
        shift
    } else {
        0
    };
    let max = cfg.max_pitch_shift.abs();
    applied.clamp(-max, max)
}

fn segments_or_fallback(track: &TrackAnalysis, fallback: Segment) -> Vec<Segment> {
    if track.segments.is_empty() {
        vec![fallback]
    } else {
        track.segments.clone()
    }
}

fn distinct_labels(segs: &[Segment], allowed: &[SegmentLabel]) -> Vec<SegmentLabel> {
    let mut labels: Vec<SegmentLabel> = segs
        .iter()
        .map(|s| s.label)
        .filter(|l| allowed.contains(l))
        .collect();
    labels.sort();
    labels.dedup();
    labels
}

fn pick_with_label<'a, R: Rng + ?Sized>(
    segs: &'a [Segment],
    label: SegmentLabel,
    rng: &mut R,
) -> &'a Segment {
    let matching: Vec<&Segment> = segs.iter().filter(|s| s.label == label).collect();
    if matching.is_empty() {
        // Only reached for the synthetic fallback label.
        return &segs[rng.random_range(0..segs.len())];
    }
    matching[rng.random_range(0..matching.len())]
}

/// Stratified draw of an exit segment of A and entry segment of B.
///
/// A label is drawn uniformly first, then a segment with that label, so rare
/// labels are not starved. Outro->Intro is redrawn unless it passes the
/// acceptance roll; once the retries run out the last draw stands.
pub fn stratified_pair<'a, R: Rng + ?Sized>(
    segs_a: &'a [Segment],
    segs_b: &'a [Segment],
    cfg: &PlannerConfig,
    rng: &mut R,
) -> (&'a Segment, &'a Segment) {
    let mut labels_a = distinct_labels(segs_a, &EXIT_LABELS);
    let mut labels_b = distinct_labels(segs_b, &ENTRY_LABELS);
    if labels_a.is_empty() {
        labels_a.push(SegmentLabel::Outro);
    }
    if labels_b.is_empty() {
        labels_b.push(SegmentLabel::Intro);
    }

    let draw = |rng: &mut R| {
        (
            labels_a[rng.random_range(0..labels_a.len())],
            labels_b[rng.random_range(0..labels_b.len())],
        )
    };
    let (mut la, mut lb) = draw(rng);
    for _ in 0..cfg.pairing_retries {
        let boring = la == SegmentLabel::Outro && lb == SegmentLabel::Intro;
        if !boring || rng.random_bool(cfg.outro_intro_acceptance.clamp(0.0, 1.0)) {
            break;
        }
        (la, lb) = draw(rng);
    }
    (
        pick_with_label(segs_a, la, rng),
        pick_with_label(segs_b, lb, rng),
    )
}

/// Exit point in A derived from a segment: energy peak plus a fixed step,
/// else a fixed fraction into the phrase, snapped to the heuristic grid.
fn heuristic_exit(a: &TrackAnalysis, seg: &Segment, cfg: &PlannerConfig) -> f64 {
    let spb = a.seconds_per_beat();
    let seg_len = cfg.phrase_beats as f64 * spb;
    let window = beats_in_window(&a.beat_times, seg.time, seg.time + seg_len);

    let raw = if window.len() > 4 && !a.energy_curve.is_empty() {
        let energy = |i: usize| a.energy_curve.get(i).copied().unwrap_or(0.5);
        let mut peak = window.start;
        for i in window.clone() {
            if energy(i) > energy(peak) {
                peak = i;
            }
        }
        let step = cfg.exit_step_bars as usize * 4;
        let idx = (peak + step).min(window.end - 1);
        a.beat_times[idx]
    } else {
        let fraction = if seg.label.is_chorus_like() {
            cfg.chorus_exit_fraction
        } else {
            cfg.other_exit_fraction
        };
        seg.time + seg_len * fraction
    };
    snap_to_grid(raw, &a.beat_times, cfg.heuristic_grid_beats)
}

/// Resolve A's exit time: manual boundary offset by the zone length, else heuristic.
fn resolve_exit(a: &TrackAnalysis, seg: &Segment, bars: u32, cfg: &PlannerConfig) -> f64 {
    let t = match a.manual_out {
        Some(manual) => {
            let raw = manual + bars_to_seconds(bars, a.bpm);
            snap_to_grid(raw, &a.beat_times, cfg.manual_grid_beats)
        }
        None => heuristic_exit(a, seg, cfg),
    };
    a.clamp_time(t)
}

/// Resolve B's entry time: manual boundary minus the zone length, else the segment start.
fn resolve_entry(b: &TrackAnalysis, seg: &Segment, bars: u32, cfg: &PlannerConfig) -> f64 {
    let t = match b.manual_in {
        Some(manual) => {
            let raw = manual - bars_to_seconds(bars, b.bpm);
            snap_to_grid(raw, &b.beat_times, cfg.manual_grid_beats)
        }
        None => snap_to_grid(seg.time, &b.beat_times, cfg.heuristic_grid_beats),
    };
    b.clamp_time(t)
}

/// Generate `count` candidates for A -> B.
pub fn generate_candidates<R: Rng + ?Sized>(
    a: &TrackAnalysis,
    b: &TrackAnalysis,
    count: usize,
    weights: &PreferenceWeights,
    cfg: &PlannerConfig,
    rng: &mut R,
) -> Vec<TransitionCandidate> {
    let segs_a = segments_or_fallback(
        a,
        Segment {
            time: (a.duration - 30.0).max(0.0),
            label: SegmentLabel::Outro,
            energy: 0.5,
            vocal_energy: 0.5,
        },
    );
    let segs_b = segments_or_fallback(
        b,
        Segment {
            time: 0.0,
            label: SegmentLabel::Intro,
            energy: 0.5,
            vocal_energy: 0.5,
        },
    );

    let (speed_a, speed_b) = sync_speeds(a.bpm, b.bpm, cfg.sync_threshold_bpm);
    if speed_a == 1.0 && speed_b == 1.0 && a.bpm != b.bpm {
        log::debug!(
            "Tempo sync infeasible for {} ({:.1} BPM) -> {} ({:.1} BPM), playing at native speed",
            a.display_name(),
            a.bpm,
            b.display_name(),
            b.bpm
        );
    }
    let target = target_bpm(a, b, cfg.sync_threshold_bpm);
    let harmonic_shift = shift_toward(&a.key, &b.key);

    (0..count)
        .map(|_| {
            let kind = weights.draw_type(rng);
            let picked_bars = weights.draw_bars(rng);
            let (exit_seg, entry_seg) = stratified_pair(&segs_a, &segs_b, cfg, rng);

            let a_out_time = resolve_exit(a, exit_seg, picked_bars, cfg);
            let b_in_time = resolve_entry(b, entry_seg, picked_bars, cfg);
            let pitch_shift_b = choose_pitch(harmonic_shift, cfg, rng);

            let mut duration_seconds = bars_to_seconds(picked_bars, target);
            let mut bar_length = picked_bars;
            if kind == TransitionType::Mashup {
                duration_seconds = duration_seconds.max(cfg.mashup_min_secs);
                bar_length = bar_length.max(cfg.mashup_min_bars);
            }

            let mut feature_tags = vec![
                format!("Type:{}", kind),
                format!("Len:{}Bar", picked_bars),
                format!("Struct:{}->{}", exit_seg.label, entry_seg.label),
            ];
            if kind == TransitionType::Mashup && entry_seg.vocal_energy > 0.5 {
                feature_tags.push("Mashup:VocalLayering".to_string());
            }

            TransitionCandidate {
                kind,
                bar_length,
                a_out_time,
                b_in_time,
                speed_a,
                speed_b,
                pitch_shift_b,
                filter: FilterType::for_type(kind),
                duration_seconds,
                feature_tags,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::make_track;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn only_type(t: TransitionType, bars: u32) -> PreferenceWeights {
        let mut w = PreferenceWeights::default();
        for other in TransitionType::ALL {
            w.set_type(other, 0.0).unwrap();
        }
        w.set_type(t, 1.0).unwrap();
        w.bars.clear();
        w.set_bars(bars, 1.0).unwrap();
        w
    }

    #[test]
    fn test_candidates_within_bounds() {
        let cfg = PlannerConfig::default();
        let w = PreferenceWeights::default();
        let mut rng = StdRng::seed_from_u64(42);
        let keys = ["C Major", "F# Major", "E Minor", "Bb Major"];
        for (i, key_b) in keys.iter().enumerate() {
            let a = make_track("a", 88.0 + i as f64 * 9.0, 200.0, "C Major");
            let mut b = make_track("b", 120.0 - i as f64 * 7.0, 150.0, key_b);
            if i % 2 == 0 {
                b.manual_in = Some(2.0);
            }
            for c in generate_candidates(&a, &b, 50, &w, &cfg, &mut rng) {
                assert!(c.a_out_time >= 0.0 && c.a_out_time <= a.duration);
                assert!(c.b_in_time >= 0.0 && c.b_in_time <= b.duration);
                assert!((-2..=2).contains(&c.pitch_shift_b));
                assert!(c.duration_seconds > 0.0);
            }
        }
    }

    #[test]
    fn test_sync_only_below_threshold() {
        let cfg = PlannerConfig::default();
        let w = PreferenceWeights::default();
        let mut rng = StdRng::seed_from_u64(1);
        let a = make_track("a", 90.0, 180.0, "C Major");

        let near = make_track("b", 109.0, 180.0, "C Major");
        for c in generate_candidates(&a, &near, 10, &w, &cfg, &mut rng) {
            assert_ne!(c.speed_a, 1.0);
            assert_ne!(c.speed_b, 1.0);
        }

        let far = make_track("b", 110.0, 180.0, "C Major");
        for c in generate_candidates(&a, &far, 10, &w, &cfg, &mut rng) {
            assert_eq!(c.speed_a, 1.0);
            assert_eq!(c.speed_b, 1.0);
        }
    }

    #[test]
    fn test_manual_bounds_relative_keys() {
        let cfg = PlannerConfig::default();
        let w = only_type(TransitionType::Crossfade, 4);
        let mut rng = StdRng::seed_from_u64(7);
        let mut a = make_track("a", 90.0, 240.0, "C Major");
        let mut b = make_track("b", 94.0, 240.0, "A Minor");
        a.manual_out = Some(120.0);
        b.manual_in = Some(10.0);

        let cands = generate_candidates(&a, &b, 8, &w, &cfg, &mut rng);
        assert_eq!(cands.len(), 8);
        for c in &cands {
            assert_eq!(c.kind, TransitionType::Crossfade);
            assert!((c.speed_a - 92.0 / 90.0).abs() < 1e-9);
            assert!((c.speed_b - 92.0 / 94.0).abs() < 1e-9);
            assert_eq!(c.pitch_shift_b, 0);
            assert!((c.duration_seconds - 10.4348).abs() < 1e-3);
            assert_eq!(c.filter, None);
            // exit sits one zone after the manual out, entry one zone before the manual in
            assert!(c.a_out_time > 120.0);
            assert!(c.b_in_time < 10.0);
        }
    }

    #[test]
    fn test_mashup_floor_and_tags() {
        let cfg = PlannerConfig::default();
        let w = only_type(TransitionType::Mashup, 4);
        let mut rng = StdRng::seed_from_u64(9);
        let a = make_track("a", 128.0, 200.0, "C Major");
        let mut b = make_track("b", 128.0, 200.0, "C Major");
        for s in &mut b.segments {
            s.vocal_energy = 0.8;
        }
        for c in generate_candidates(&a, &b, 10, &w, &cfg, &mut rng) {
            assert!(c.duration_seconds >= 15.0);
            assert_eq!(c.bar_length, 8);
            assert_eq!(c.filter, Some(FilterType::MashupSplit));
            assert!(c.feature_tags.contains(&"Mashup:VocalLayering".to_string()));
            assert!(c.feature_tags.contains(&"Len:4Bar".to_string()));
        }
    }

    #[test]
    fn test_filter_assignment() {
        assert_eq!(FilterType::for_type(TransitionType::BassSwap), Some(FilterType::HighPass));
        assert_eq!(FilterType::for_type(TransitionType::FilterFade), Some(FilterType::LowPass));
        assert_eq!(FilterType::for_type(TransitionType::Cut), None);
    }

    #[test]
    fn test_pitch_probabilities() {
        let cfg = PlannerConfig::default();
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            assert_eq!(choose_pitch(-2, &cfg, &mut rng), -2);
            let medium = choose_pitch(4, &cfg, &mut rng);
            assert!(medium == 0 || medium == 2);
            let large = choose_pitch(-6, &cfg, &mut rng);
            assert!(large == 0 || large == -2);
        }
        let never = PlannerConfig {
            pitch_prob_large: 0.0,
            ..PlannerConfig::default()
        };
        assert_eq!(choose_pitch(6, &never, &mut rng), 0);
    }

    #[test]
    fn test_outro_intro_is_rare() {
        let cfg = PlannerConfig::default();
        let mut rng = StdRng::seed_from_u64(13);
        let seg = |label| Segment {
            time: 0.0,
            label,
            energy: 0.5,
            vocal_energy: 0.0,
        };
        let segs_a = vec![seg(SegmentLabel::Outro), seg(SegmentLabel::Verse)];
        let segs_b = vec![seg(SegmentLabel::Intro), seg(SegmentLabel::Chorus)];
        let n = 2000;
        let boring = (0..n)
            .filter(|_| {
                let (x, y) = stratified_pair(&segs_a, &segs_b, &cfg, &mut rng);
                x.label == SegmentLabel::Outro && y.label == SegmentLabel::Intro
            })
            .count();
        // uniform would be 25%
        assert!(boring < n / 20, "boring {}", boring);
    }

    #[test]
    fn test_only_boring_labels_still_yield_a_pair() {
        let cfg = PlannerConfig::default();
        let mut rng = StdRng::seed_from_u64(2);
        let a = Segment { time: 10.0, label: SegmentLabel::Outro, energy: 0.5, vocal_energy: 0.0 };
        let b = Segment { time: 0.0, label: SegmentLabel::Intro, energy: 0.5, vocal_energy: 0.0 };
        let (x, y) = stratified_pair(std::slice::from_ref(&a), std::slice::from_ref(&b), &cfg, &mut rng);
        assert_eq!(x.label, SegmentLabel::Outro);
        assert_eq!(y.label, SegmentLabel::Intro);
    }

    #[test]
    fn test_missing_segments_fall_back() {
        let cfg = PlannerConfig::default();
        let w = PreferenceWeights::default();
        let mut rng = StdRng::seed_from_u64(21);
        let mut a = make_track("a", 100.0, 180.0, "C Major");
        let mut b = make_track("b", 100.0, 180.0, "C Major");
        a.segments.clear();
        b.segments.clear();
        for c in generate_candidates(&a, &b, 5, &w, &cfg, &mut rng) {
            assert!(c.feature_tags.contains(&"Struct:Outro->Intro".to_string()));
            assert_eq!(c.b_in_time, 0.0);
        }
    }
}
