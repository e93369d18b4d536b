//! Timeline renderer: stitches track bodies and transition zones into one
//! continuous buffer, left to right, and records where each track starts.
//!
//! Bodies play at native speed and pitch. Only the transition zone is
//! stretched, pitch-shifted and filtered. Any decode or DSP failure inside a
//! body or zone is replaced by silence of the requested length so the rest
//! of the mix still renders; only the final export can fail the render.

pub mod markers;
pub mod preview;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::config::RenderConfig;
use crate::dsp::{AudioBuffer, DspError, FilterKind, SignalProcessor, TimeWindow};
use crate::planner::candidates::{FilterType, TransitionCandidate};
use crate::track::TrackAnalysis;
use crate::weights::TransitionType;
use markers::Marker;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Nothing to render")]
    Empty,
    #[error("{tracks} tracks need {expected} transitions, got {got}")]
    TransitionCount {
        tracks: usize,
        expected: usize,
        got: usize,
    },
    #[error("Render cancelled")]
    Cancelled,
    #[error("Export to {path} failed: {source}")]
    Export { path: PathBuf, source: DspError },
    #[error("Cannot write marker file {path}: {source}")]
    Markers {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Renderer state. Every adjacent pair walks PreTrack -> TransitionZone,
/// and the last track finishes in PostTrack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Body of track `i` up to the start of its outgoing zone.
    PreTrack(usize),
    /// Zone joining track `i` into track `i + 1`.
    TransitionZone(usize),
    /// Remainder of the last track.
    PostTrack(usize),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    Body { track: usize },
    Transition { from: usize, kind: TransitionType },
}

/// One rendered span of the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineZone {
    pub kind: ZoneKind,
    pub start_frame: usize,
    pub frames: usize,
    /// Frames over which the outgoing side fades out (0 when not faded).
    pub fade_out_frames: usize,
    /// Frames over which the incoming side fades in (0 when not faded).
    pub fade_in_frames: usize,
    /// Some part of this span was replaced by silence.
    pub fallback: bool,
}

/// Ordered zones of a rendered mix plus the track-start markers.
#[derive(Debug, Clone, PartialEq)]
pub struct MixTimeline {
    pub sample_rate: u32,
    pub zones: Vec<TimelineZone>,
    pub markers: Vec<Marker>,
}

impl MixTimeline {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            zones: Vec::new(),
            markers: Vec::new(),
        }
    }

    /// Zones where silence was substituted.
    pub fn fallbacks(&self) -> usize {
        self.zones.iter().filter(|z| z.fallback).count()
    }
}

pub struct RenderedMix {
    pub audio: AudioBuffer,
    pub timeline: MixTimeline,
}

/// Audio for one transition zone.
struct RenderedZone {
    audio: AudioBuffer,
    fade_out_frames: usize,
    fade_in_frames: usize,
    /// Source time in B where its body resumes.
    b_resume: f64,
    fallback: bool,
}

/// Processing applied to a decoded window.
#[derive(Debug, Clone, Copy)]
struct Pass {
    speed: f64,
    semitones: i32,
    filter: Option<(FilterKind, f32)>,
}

impl Pass {
    const NATIVE: Pass = Pass {
        speed: 1.0,
        semitones: 0,
        filter: None,
    };
}

fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

pub struct Renderer<'a> {
    dsp: &'a dyn SignalProcessor,
    cfg: &'a RenderConfig,
}

impl<'a> Renderer<'a> {
    pub fn new(dsp: &'a dyn SignalProcessor, cfg: &'a RenderConfig) -> Self {
        Self { dsp, cfg }
    }

    fn empty_buffer(&self) -> AudioBuffer {
        AudioBuffer::new(Vec::new(), self.dsp.sample_rate(), self.dsp.channels())
    }

    fn silence(&self, secs: f64) -> AudioBuffer {
        AudioBuffer::silence(secs, self.dsp.sample_rate(), self.dsp.channels())
    }

    fn try_fetch(
        &self,
        track: &TrackAnalysis,
        window: TimeWindow,
        pass: Pass,
    ) -> Result<AudioBuffer, DspError> {
        let mut buf = self.dsp.decode(&track.path, Some(window))?;
        if (pass.speed - 1.0).abs() > 1e-9 {
            buf = self.dsp.stretch(&buf, pass.speed)?;
        }
        if pass.semitones != 0 {
            buf = self.dsp.pitch_shift(&buf, pass.semitones as f64)?;
        }
        if let Some((kind, cutoff)) = pass.filter {
            buf = self.dsp.filter(&buf, kind, cutoff)?;
        }
        Ok(buf)
    }

    /// Decode and process a window, substituting `fallback_secs` of silence
    /// on failure. The flag reports whether the fallback was used.
    fn fetch(
        &self,
        track: &TrackAnalysis,
        window: TimeWindow,
        pass: Pass,
        fallback_secs: f64,
        op: &str,
    ) -> (AudioBuffer, bool) {
        if window.is_empty() {
            return (self.empty_buffer(), false);
        }
        match self.try_fetch(track, window, pass) {
            Ok(buf) => (buf, false),
            Err(e) => {
                log::warn!(
                    "{} of {} [{:.2}s, {:.2}s] failed, using {:.2}s of silence: {}",
                    op,
                    track.path.display(),
                    window.start,
                    window.end,
                    fallback_secs,
                    e
                );
                (self.silence(fallback_secs), true)
            }
        }
    }

    /// Body of a track between two source times at native speed.
    fn body(&self, track: &TrackAnalysis, start: f64, end: f64) -> (AudioBuffer, bool) {
        let start = track.clamp_time(start);
        let end = track.clamp_time(end);
        let window = TimeWindow::new(start, end);
        self.fetch(track, window, Pass::NATIVE, window.len(), "body")
    }

    /// Source time in A where its outgoing zone (or, for a cut, the cut) starts.
    fn exit_point(&self, a: &TrackAnalysis, t: &TransitionCandidate, entry: f64) -> f64 {
        let a_out = a.clamp_time(t.a_out_time);
        let start = match t.kind {
            TransitionType::Cut => a_out,
            _ => a_out - t.duration_seconds.max(0.0) * t.speed_a,
        };
        if start < entry {
            log::debug!(
                "Zone into {} would start at {:.2}s before the entry at {:.2}s; starting at entry",
                a.display_name(),
                start,
                entry
            );
        }
        start.max(entry)
    }

    /// Render the zone joining `a` into `b`. A's window starts at `a_start`
    /// and ends at the exit point; B's covers the same musical span from the
    /// entry point. Both are stretched to the shared target tempo and A is
    /// fitted to B's stretched length, so B's body continues without a gap.
    fn zone(
        &self,
        a: &TrackAnalysis,
        b: &TrackAnalysis,
        t: &TransitionCandidate,
        a_start: f64,
    ) -> RenderedZone {
        let dur = t.duration_seconds.max(0.0);
        let b_in = b.clamp_time(t.b_in_time);
        let b_resume = b.clamp_time(b_in + dur * t.speed_b);

        let b_filter = match t.filter {
            Some(FilterType::MashupSplit) => Some((FilterKind::HighPass, self.cfg.highpass_hz)),
            _ => None,
        };
        let (mut b_buf, b_failed) = self.fetch(
            b,
            TimeWindow::new(b_in, b_resume),
            Pass {
                speed: t.speed_b,
                semitones: t.pitch_shift_b,
                filter: b_filter,
            },
            dur,
            "zone entry",
        );

        if t.kind == TransitionType::Cut {
            return RenderedZone {
                audio: b_buf,
                fade_out_frames: 0,
                fade_in_frames: 0,
                b_resume,
                fallback: b_failed,
            };
        }

        let a_filter = match t.filter {
            Some(FilterType::HighPass) => Some((FilterKind::HighPass, self.cfg.highpass_hz)),
            Some(FilterType::LowPass) => Some((FilterKind::LowPass, self.cfg.lowpass_hz)),
            Some(FilterType::MashupSplit) | None => None,
        };
        let a_out = a.clamp_time(t.a_out_time);
        let (mut a_buf, a_failed) = self.fetch(
            a,
            TimeWindow::new(a_start, a_out.max(a_start)),
            Pass {
                speed: t.speed_a,
                semitones: 0,
                filter: a_filter,
            },
            dur,
            "zone exit",
        );

        let frames = b_buf.frames();
        a_buf.fit_frames(frames);

        let (fade_out, fade_in) = match t.kind {
            TransitionType::Crossfade | TransitionType::BassSwap => {
                a_buf.apply_envelope(|x| 1.0 - x);
                b_buf.apply_envelope(|x| x);
                (frames, frames)
            }
            TransitionType::FilterFade => {
                // Equal-power so the low-passed tail does not dip in the middle.
                let half_pi = std::f32::consts::FRAC_PI_2;
                a_buf.apply_envelope(|x| (x * half_pi).cos());
                b_buf.apply_envelope(|x| (x * half_pi).sin());
                (frames, frames)
            }
            TransitionType::Mashup => {
                a_buf.apply_gain(db_to_gain(self.cfg.mashup_gain_a_db));
                b_buf.apply_gain(db_to_gain(self.cfg.mashup_gain_b_db));
                (0, 0)
            }
            TransitionType::Cut => (0, 0),
        };

        a_buf.mix_in(&b_buf);
        RenderedZone {
            audio: a_buf,
            fade_out_frames: fade_out,
            fade_in_frames: fade_in,
            b_resume,
            fallback: a_failed || b_failed,
        }
    }

    fn trim_lead(&self, buf: &mut AudioBuffer) {
        let (lead, _) = buf.silent_edges(self.cfg.silence_threshold_db);
        if lead > 0 {
            let ch = buf.channels as usize;
            buf.samples.drain(..lead * ch);
            log::debug!("Trimmed {} leading silent frames", lead);
        }
    }

    fn trim_trail(&self, buf: &mut AudioBuffer) {
        let (_, trail) = buf.silent_edges(self.cfg.silence_threshold_db);
        if trail > 0 {
            let keep = buf.frames().saturating_sub(trail);
            buf.fit_frames(keep);
            log::debug!("Trimmed {} trailing silent frames", trail);
        }
    }

    /// Assemble the raw mix without mastering.
    fn assemble(
        &self,
        tracks: &[TrackAnalysis],
        transitions: &[TransitionCandidate],
        cancel: &AtomicBool,
    ) -> Result<RenderedMix, RenderError> {
        if tracks.is_empty() {
            return Err(RenderError::Empty);
        }
        let last = tracks.len() - 1;
        if transitions.len() != last {
            return Err(RenderError::TransitionCount {
                tracks: tracks.len(),
                expected: last,
                got: transitions.len(),
            });
        }

        let sr = self.dsp.sample_rate();
        let mut out = self.empty_buffer();
        let mut timeline = MixTimeline::new(sr);

        let pb = ProgressBar::new((2 * tracks.len() - 1) as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );

        // Source time in the current track where its body starts.
        let mut entry = 0.0f64;
        // Source time in the current track where its outgoing zone starts.
        let mut exit = 0.0f64;
        let mut stage = if last == 0 {
            Stage::PostTrack(0)
        } else {
            Stage::PreTrack(0)
        };

        while stage != Stage::Done {
            if cancel.load(Ordering::Relaxed) {
                pb.abandon_with_message("cancelled");
                return Err(RenderError::Cancelled);
            }
            stage = match stage {
                Stage::PreTrack(i) => {
                    let track = &tracks[i];
                    pb.set_message(track.display_name());
                    exit = self.exit_point(track, &transitions[i], entry);
                    let (mut body, fallback) = self.body(track, entry, exit);
                    if i == 0 {
                        if !fallback {
                            self.trim_lead(&mut body);
                        }
                        timeline.markers.push(Marker::at_frame(0, sr, track.display_name()));
                    }
                    push_span(&mut out, &mut timeline, ZoneKind::Body { track: i }, body, 0, 0, fallback);
                    Stage::TransitionZone(i)
                }
                Stage::TransitionZone(i) => {
                    let t = &transitions[i];
                    let next = &tracks[i + 1];
                    let zone = self.zone(&tracks[i], next, t, exit);
                    timeline
                        .markers
                        .push(Marker::at_frame(out.frames(), sr, next.display_name()));
                    entry = zone.b_resume;
                    push_span(
                        &mut out,
                        &mut timeline,
                        ZoneKind::Transition {
                            from: i,
                            kind: t.kind,
                        },
                        zone.audio,
                        zone.fade_out_frames,
                        zone.fade_in_frames,
                        zone.fallback,
                    );
                    if i + 1 == last {
                        Stage::PostTrack(i + 1)
                    } else {
                        Stage::PreTrack(i + 1)
                    }
                }
                Stage::PostTrack(i) => {
                    let track = &tracks[i];
                    pb.set_message(track.display_name());
                    let (mut body, fallback) = self.body(track, entry, track.duration);
                    if i == 0 {
                        if !fallback {
                            self.trim_lead(&mut body);
                        }
                        timeline.markers.push(Marker::at_frame(0, sr, track.display_name()));
                    }
                    // Substituted silence keeps its requested length.
                    if !fallback {
                        self.trim_trail(&mut body);
                    }
                    push_span(&mut out, &mut timeline, ZoneKind::Body { track: i }, body, 0, 0, fallback);
                    Stage::Done
                }
                Stage::Done => Stage::Done,
            };
            pb.inc(1);
        }
        pb.finish_with_message(format!("{:.1}s rendered", out.duration_secs()));

        Ok(RenderedMix {
            audio: out,
            timeline,
        })
    }

    /// Peak-normalise with a bounded boost, then fade out the tail.
    pub fn master(&self, buf: &mut AudioBuffer) {
        let peak = buf.peak();
        if peak > 1e-9 {
            let gain = (self.cfg.target_peak / peak).min(self.cfg.max_boost);
            buf.apply_gain(gain);
            log::debug!("Normalised peak {:.3} with gain {:.3}", peak, gain);
        }
        let total = buf.frames();
        let n = buf.secs_to_frames(self.cfg.tail_fade_secs).min(total);
        if n == 0 {
            return;
        }
        let ch = buf.channels as usize;
        let start = total - n;
        for (k, frame) in buf.samples[start * ch..].chunks_exact_mut(ch).enumerate() {
            let g = 1.0 - (k + 1) as f32 / n as f32;
            for s in frame {
                *s *= g;
            }
        }
    }

    /// Render the whole playlist: assemble, then master.
    pub fn render(
        &self,
        tracks: &[TrackAnalysis],
        transitions: &[TransitionCandidate],
        cancel: &AtomicBool,
    ) -> Result<RenderedMix, RenderError> {
        log::info!("Rendering {} tracks", tracks.len());
        let mut mix = self.assemble(tracks, transitions, cancel)?;
        if mix.timeline.fallbacks() > 0 {
            log::warn!(
                "{} span(s) were replaced by silence",
                mix.timeline.fallbacks()
            );
        }
        self.master(&mut mix.audio);
        Ok(mix)
    }

    /// Export the mix to `output` and its marker file next to it (same stem).
    /// Returns the marker file path. Nothing is left at either path on failure.
    pub fn write(&self, mix: &RenderedMix, output: &Path) -> Result<PathBuf, RenderError> {
        let lrc = markers::lrc_path(output);
        let title = output
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(crate::APP_NAME);
        let staged = markers::stage_lrc(&mix.timeline.markers, title, &lrc).map_err(|source| {
            RenderError::Markers {
                path: lrc.clone(),
                source,
            }
        })?;
        self.dsp
            .export(&mix.audio, output, self.cfg.bitrate_kbps)
            .map_err(|source| RenderError::Export {
                path: output.to_path_buf(),
                source,
            })?;
        if let Err(e) = staged.persist(&lrc) {
            std::fs::remove_file(output).ok();
            return Err(RenderError::Markers {
                path: lrc,
                source: e.error,
            });
        }
        log::info!("Wrote {} and {}", output.display(), lrc.display());
        Ok(lrc)
    }
}

fn push_span(
    out: &mut AudioBuffer,
    timeline: &mut MixTimeline,
    kind: ZoneKind,
    audio: AudioBuffer,
    fade_out_frames: usize,
    fade_in_frames: usize,
    fallback: bool,
) {
    timeline.zones.push(TimelineZone {
        kind,
        start_frame: out.frames(),
        frames: audio.frames(),
        fade_out_frames,
        fade_in_frames,
        fallback,
    });
    out.append(&audio);
}
