//! Greedy playlist ordering for harmonic, tempo and energy flow.

use crate::key::wheel_distance;
use crate::track::TrackAnalysis;

/// Score for a Camelot wheel distance.
pub fn harmonic_score(distance: u8) -> f64 {
    match distance {
        0 => 100.0,
        1 => 80.0,
        2 => 40.0,
        3 => 20.0,
        4 => 10.0,
        _ => 0.0,
    }
}

/// Score for an absolute BPM gap.
pub fn tempo_score(bpm_gap: f64) -> f64 {
    let gap = bpm_gap.abs();
    if gap < 3.0 {
        50.0
    } else if gap < 8.0 {
        35.0
    } else if gap < 15.0 {
        15.0
    } else if gap < 25.0 {
        0.0
    } else {
        -30.0
    }
}

/// Tiebreak on mean energy.
pub fn energy_score(energy_gap: f64) -> f64 {
    (15.0 - 30.0 * energy_gap.abs()).max(0.0)
}

/// Composite score for placing `next` right after `prev`.
pub fn pair_score(prev: &TrackAnalysis, next: &TrackAnalysis) -> f64 {
    harmonic_score(wheel_distance(&prev.key, &next.key))
        + tempo_score(prev.bpm - next.bpm)
        + energy_score(prev.mean_energy() - next.mean_energy())
}

/// Sum of adjacent pair scores along `order`.
pub fn chain_score(tracks: &[TrackAnalysis], order: &[usize]) -> f64 {
    order
        .windows(2)
        .map(|w| pair_score(&tracks[w[0]], &tracks[w[1]]))
        .sum()
}

/// Order tracks by greedy nearest neighbour, returning indices into `tracks`.
///
/// Starts from the slowest track and repeatedly appends the remaining track
/// scoring highest against the current tail. Ties go to the earliest index.
/// Two or fewer tracks keep their input order.
pub fn sequence(tracks: &[TrackAnalysis]) -> Vec<usize> {
    let n = tracks.len();
    if n <= 2 {
        return (0..n).collect();
    }

    let mut remaining: Vec<usize> = (0..n).collect();
    let seed_pos = remaining
        .iter()
        .enumerate()
        .fold(0, |best, (pos, &idx)| {
            if tracks[idx].bpm < tracks[remaining[best]].bpm {
                pos
            } else {
                best
            }
        });
    let mut order = vec![remaining.remove(seed_pos)];

    while !remaining.is_empty() {
        let tail = &tracks[order[order.len() - 1]];
        let mut best_pos = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let score = pair_score(tail, &tracks[idx]);
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        let picked = remaining.remove(best_pos);
        log::debug!(
            "Sequencer: {} -> {} (score {:.1})",
            tail.display_name(),
            tracks[picked].display_name(),
            best_score
        );
        order.push(picked);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::make_track;

    #[test]
    fn test_bucket_scores() {
        assert_eq!(harmonic_score(0), 100.0);
        assert_eq!(harmonic_score(2), 40.0);
        assert_eq!(harmonic_score(6), 0.0);
        assert_eq!(tempo_score(2.9), 50.0);
        assert_eq!(tempo_score(-7.0), 35.0);
        assert_eq!(tempo_score(14.0), 15.0);
        assert_eq!(tempo_score(24.9), 0.0);
        assert_eq!(tempo_score(25.0), -30.0);
        assert_eq!(energy_score(0.0), 15.0);
        assert_eq!(energy_score(0.9), 0.0);
    }

    #[test]
    fn test_small_playlists_keep_order() {
        let a = make_track("a", 140.0, 60.0, "C Major");
        let b = make_track("b", 90.0, 60.0, "C Major");
        assert_eq!(sequence(&[]), Vec::<usize>::new());
        assert_eq!(sequence(&[a.clone()]), vec![0]);
        assert_eq!(sequence(&[a, b]), vec![0, 1]);
    }

    #[test]
    fn test_output_is_permutation() {
        let keys = ["C Major", "G Major", "A Minor", "F# Major", "E Minor", "D Major", "B Minor"];
        let tracks: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| make_track(&format!("t{}", i), 85.0 + (i as f64 * 13.0) % 50.0, 120.0, k))
            .collect();
        let mut order = sequence(&tracks);
        assert_eq!(order.len(), tracks.len());
        order.sort_unstable();
        assert_eq!(order, (0..tracks.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_seed_is_slowest_track() {
        let tracks = vec![
            make_track("fast", 128.0, 60.0, "C Major"),
            make_track("slow", 84.0, 60.0, "C Major"),
            make_track("mid", 100.0, 60.0, "C Major"),
        ];
        assert_eq!(sequence(&tracks)[0], 1);
    }

    #[test]
    fn test_tempo_outlier_not_in_the_middle() {
        let tracks = vec![
            make_track("a", 80.0, 60.0, "C Major"),
            make_track("b", 150.0, 60.0, "C Major"),
            make_track("c", 82.0, 60.0, "C Major"),
        ];
        let order = sequence(&tracks);
        let outlier_middle = vec![0, 1, 2];
        assert!(chain_score(&tracks, &order) > chain_score(&tracks, &outlier_middle));
        // the 150 BPM track has only one neighbour
        assert_ne!(order[1], 1);
    }

    #[test]
    fn test_harmony_dominates_tiebreak() {
        let tracks = vec![
            make_track("seed", 90.0, 60.0, "C Major"),
            make_track("clash", 91.0, 60.0, "F# Major"),
            make_track("relative", 91.0, 60.0, "A Minor"),
        ];
        assert_eq!(sequence(&tracks), vec![0, 2, 1]);
    }
}
