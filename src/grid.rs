//! Beat-grid helpers.

/// Index of the beat closest to `time`. First match wins on exact ties.
/// Returns `None` for an empty grid.
pub fn nearest_beat_index(beats: &[f64], time: f64) -> Option<usize> {
    if beats.is_empty() {
        return None;
    }
    // Beats are sorted, so binary search then compare the two neighbours.
    let pos = beats.partition_point(|&b| b < time);
    if pos == 0 {
        return Some(0);
    }
    if pos >= beats.len() {
        return Some(beats.len() - 1);
    }
    let before = time - beats[pos - 1];
    let after = beats[pos] - time;
    Some(if before <= after { pos - 1 } else { pos })
}

/// Snap `time` to the nearest beat whose index is a multiple of `grid_beats`.
///
/// An index rounded past the last beat falls back to the highest grid line
/// that exists. An empty grid returns `time` unchanged. Snapping a time that
/// already sits on the grid returns it unchanged.
pub fn snap_to_grid(time: f64, beats: &[f64], grid_beats: usize) -> f64 {
    let Some(closest) = nearest_beat_index(beats, time) else {
        return time;
    };
    let grid = grid_beats.max(1);
    let max_idx = beats.len() - 1;
    let mut idx = ((closest as f64 / grid as f64).round() as usize) * grid;
    if idx > max_idx {
        idx = (max_idx / grid) * grid;
    }
    beats[idx.min(max_idx)]
}

/// Indices of beats in `[start, end)`.
pub fn beats_in_window(beats: &[f64], start: f64, end: f64) -> std::ops::Range<usize> {
    let lo = beats.partition_point(|&b| b < start);
    let hi = beats.partition_point(|&b| b < end);
    lo..hi.max(lo)
}

/// Duration in seconds of `bars` bars of 4/4 at `bpm`.
pub fn bars_to_seconds(bars: u32, bpm: f64) -> f64 {
    if bpm <= 0.0 {
        return 0.0;
    }
    bars as f64 * 4.0 * 60.0 / bpm
}

/// Start times of every `phrase_beats`-beat phrase in the grid.
pub fn phrase_starts(beats: &[f64], phrase_beats: usize) -> Vec<f64> {
    beats.iter().step_by(phrase_beats.max(1)).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn even_grid(bpm: f64, count: usize) -> Vec<f64> {
        (0..count).map(|i| i as f64 * 60.0 / bpm).collect()
    }

    #[test]
    fn test_nearest_beat_index() {
        let beats = vec![0.0, 0.5, 1.0, 1.5];
        assert_eq!(nearest_beat_index(&beats, -1.0), Some(0));
        assert_eq!(nearest_beat_index(&beats, 0.2), Some(0));
        assert_eq!(nearest_beat_index(&beats, 0.25), Some(0));
        assert_eq!(nearest_beat_index(&beats, 0.3), Some(1));
        assert_eq!(nearest_beat_index(&beats, 9.0), Some(3));
        assert_eq!(nearest_beat_index(&[], 1.0), None);
    }

    #[test]
    fn test_snap_rounds_to_grid_line() {
        let beats = even_grid(120.0, 100); // 0.5 s per beat
        // beat 7 rounds to beat 8 on a 4-grid
        assert_eq!(snap_to_grid(3.5, &beats, 4), 4.0);
        // beat 20 rounds to beat 16 on a 16-grid
        assert_eq!(snap_to_grid(10.0, &beats, 16), 8.0);
    }

    #[test]
    fn test_snap_floors_past_end() {
        let beats = even_grid(120.0, 45); // last index 44
        // nearest index 44 rounds to 48, floored to 32
        assert_eq!(snap_to_grid(100.0, &beats, 16), 16.0);
    }

    #[test]
    fn test_snap_is_idempotent() {
        let beats = even_grid(93.0, 300);
        for grid in [4usize, 16, 32] {
            for i in 0..200 {
                let t = i as f64 * 0.37;
                let once = snap_to_grid(t, &beats, grid);
                let twice = snap_to_grid(once, &beats, grid);
                assert_eq!(once, twice, "grid {} time {}", grid, t);
            }
        }
    }

    #[test]
    fn test_snap_empty_grid_passthrough() {
        assert_eq!(snap_to_grid(12.3, &[], 16), 12.3);
    }

    #[test]
    fn test_beats_in_window() {
        let beats = even_grid(120.0, 20);
        assert_eq!(beats_in_window(&beats, 1.0, 2.0), 2..4);
        assert_eq!(beats_in_window(&beats, 50.0, 60.0), 20..20);
    }

    #[test]
    fn test_bars_to_seconds() {
        assert!((bars_to_seconds(4, 92.0) - 10.4347826).abs() < 1e-6);
        assert_eq!(bars_to_seconds(4, 0.0), 0.0);
    }

    #[test]
    fn test_phrase_starts() {
        let beats = even_grid(120.0, 70);
        assert_eq!(phrase_starts(&beats, 32), vec![0.0, 16.0, 32.0]);
    }
}
