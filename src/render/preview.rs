//! Short previews of each planned transition, rendered in parallel.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use super::markers::Marker;
use super::{MixTimeline, RenderError, RenderedMix, Renderer, ZoneKind, push_span};
use crate::planner::candidates::TransitionCandidate;
use crate::track::TrackAnalysis;

pub struct PreviewResult {
    /// Written files, in pair order.
    pub written: Vec<PathBuf>,
    pub failed: Vec<(usize, String)>,
}

fn slug(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .take(40)
        .collect();
    s.trim_matches('_').to_string()
}

/// `preview_01_<a>_to_<b>.<ext>`
pub fn preview_file_name(index: usize, a: &TrackAnalysis, b: &TrackAnalysis, ext: &str) -> String {
    format!(
        "preview_{:02}_{}_to_{}.{}",
        index + 1,
        slug(&a.display_name()),
        slug(&b.display_name()),
        ext
    )
}

impl Renderer<'_> {
    /// The zone between `a` and `b` with a margin of plain playback either side.
    pub fn render_preview(
        &self,
        a: &TrackAnalysis,
        b: &TrackAnalysis,
        t: &TransitionCandidate,
    ) -> RenderedMix {
        let margin = self.cfg.preview_margin_secs.max(0.0);
        let sr = self.dsp.sample_rate();
        let mut out = self.empty_buffer();
        let mut timeline = MixTimeline::new(sr);

        let exit = self.exit_point(a, t, 0.0);
        let (lead, lead_failed) = self.body(a, exit - margin, exit);
        timeline.markers.push(Marker::at_frame(0, sr, a.display_name()));
        push_span(&mut out, &mut timeline, ZoneKind::Body { track: 0 }, lead, 0, 0, lead_failed);

        let zone = self.zone(a, b, t, exit);
        timeline
            .markers
            .push(Marker::at_frame(out.frames(), sr, b.display_name()));
        push_span(
            &mut out,
            &mut timeline,
            ZoneKind::Transition {
                from: 0,
                kind: t.kind,
            },
            zone.audio,
            zone.fade_out_frames,
            zone.fade_in_frames,
            zone.fallback,
        );

        let (tail, tail_failed) = self.body(b, zone.b_resume, zone.b_resume + margin);
        push_span(&mut out, &mut timeline, ZoneKind::Body { track: 1 }, tail, 0, 0, tail_failed);

        self.master(&mut out);
        RenderedMix {
            audio: out,
            timeline,
        }
    }

    /// Render and export one preview per adjacent pair into `out_dir`.
    /// Pairs are independent; a failed export is reported and the rest continue.
    pub fn write_previews(
        &self,
        tracks: &[TrackAnalysis],
        transitions: &[TransitionCandidate],
        out_dir: &Path,
        ext: &str,
        jobs: usize,
    ) -> Result<PreviewResult, RenderError> {
        use rayon::prelude::*;

        if tracks.len() != transitions.len() + 1 {
            return Err(RenderError::TransitionCount {
                tracks: tracks.len(),
                expected: tracks.len().saturating_sub(1),
                got: transitions.len(),
            });
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs.max(1))
            .build()?;
        let pb = ProgressBar::new(transitions.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );

        let results: Vec<(usize, Result<PathBuf, RenderError>)> = pool.install(|| {
            transitions
                .par_iter()
                .enumerate()
                .map(|(i, t)| {
                    let (a, b) = (&tracks[i], &tracks[i + 1]);
                    let path = out_dir.join(preview_file_name(i, a, b, ext));
                    let preview = self.render_preview(a, b, t);
                    let result = self
                        .dsp
                        .export(&preview.audio, &path, self.cfg.bitrate_kbps)
                        .map(|()| path.clone())
                        .map_err(|source| RenderError::Export { path, source });
                    pb.inc(1);
                    (i, result)
                })
                .collect()
        });

        let mut written = Vec::new();
        let mut failed = Vec::new();
        for (i, result) in results {
            match result {
                Ok(path) => written.push(path),
                Err(e) => {
                    log::warn!("Preview for pair {} failed: {}", i, e);
                    failed.push((i, e.to_string()));
                }
            }
        }
        pb.finish_with_message(format!("{} previews, {} failed", written.len(), failed.len()));
        Ok(PreviewResult { written, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::render::tests::{FakeProcessor, SR, transition};
    use crate::track::tests::make_track;
    use crate::weights::TransitionType;

    #[test]
    fn test_preview_has_margins_around_zone() {
        let a = make_track("a", 120.0, 60.0, "C Major");
        let b = make_track("b", 120.0, 60.0, "C Major");
        let dsp = FakeProcessor::new(&[(&a, 0.3), (&b, 0.3)]);
        let cfg = RenderConfig::default();
        let r = Renderer::new(&dsp, &cfg);
        let t = transition(TransitionType::Crossfade, 40.0, 10.0, 8.0);
        let p = r.render_preview(&a, &b, &t);
        assert_eq!(p.audio.frames(), 28 * SR as usize);
        assert_eq!(p.timeline.markers[1].offset_ms, 10_000);
    }

    #[test]
    fn test_preview_margin_clamps_at_track_start() {
        let a = make_track("a", 120.0, 60.0, "C Major");
        let b = make_track("b", 120.0, 60.0, "C Major");
        let dsp = FakeProcessor::new(&[(&a, 0.3), (&b, 0.3)]);
        let cfg = RenderConfig::default();
        let r = Renderer::new(&dsp, &cfg);
        let t = transition(TransitionType::Cut, 4.0, 0.0, 8.0);
        let p = r.render_preview(&a, &b, &t);
        // 4 s of A, 8 s zone of B, 10 s of B
        assert_eq!(p.audio.frames(), 22 * SR as usize);
    }

    #[test]
    fn test_write_previews_one_file_per_pair() {
        let tracks = vec![
            make_track("One", 120.0, 60.0, "C Major"),
            make_track("Two Words", 120.0, 60.0, "C Major"),
            make_track("Three", 120.0, 60.0, "C Major"),
        ];
        let dsp = FakeProcessor::new(&[(&tracks[0], 0.3), (&tracks[1], 0.3), (&tracks[2], 0.3)]);
        let cfg = RenderConfig::default();
        let r = Renderer::new(&dsp, &cfg);
        let ts = vec![
            transition(TransitionType::Crossfade, 40.0, 10.0, 8.0),
            transition(TransitionType::BassSwap, 45.0, 12.0, 8.0),
        ];
        let dir = tempfile::tempdir().unwrap();
        let result = r.write_previews(&tracks, &ts, dir.path(), "wav", 2).unwrap();
        assert!(result.failed.is_empty());
        assert_eq!(
            result.written,
            vec![
                dir.path().join("preview_01_One_to_Two_Words.wav"),
                dir.path().join("preview_02_Two_Words_to_Three.wav"),
            ]
        );
        assert!(result.written.iter().all(|p| p.exists()));
    }
}
