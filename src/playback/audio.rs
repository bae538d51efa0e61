//! Pull-based audio renderer.
//!
//! Runs inside the sink's real-time callback, so it never blocks: when
//! paused or starved it writes silence and moves on. Sample data flows
//! through a staging buffer because drift correction can change the
//! sample count of a frame, while the callback demands an exact fill.

use std::sync::Arc;

use tracing::trace;

use crate::clock::{AV_NOSYNC_THRESHOLD, SyncMode, wall_time};
use crate::media::DecodedPayload;
use crate::playback::state::{Session, StreamPipe};

/// Window length of the drift estimate; after this many callbacks the
/// moving average is ~99 % converged.
const AUDIO_DIFF_AVG_NB: u32 = 20;

/// Hard bound on per-frame sample correction, in percent.
const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;

/// Resamples `input` (interleaved) to exactly `out_frames` frames by
/// linear interpolation.
pub fn stretch_samples(input: &[f32], channels: usize, out_frames: usize) -> Vec<f32> {
    let in_frames = input.len() / channels.max(1);
    if in_frames == 0 || out_frames == 0 {
        return vec![0.0; out_frames * channels];
    }
    if in_frames == out_frames {
        return input.to_vec();
    }
    let mut out = Vec::with_capacity(out_frames * channels);
    let step = if out_frames > 1 {
        (in_frames - 1) as f64 / (out_frames - 1) as f64
    } else {
        0.0
    };
    for i in 0..out_frames {
        let pos = i as f64 * step;
        let base = pos.floor() as usize;
        let next = (base + 1).min(in_frames - 1);
        let frac = (pos - base as f64) as f32;
        for ch in 0..channels {
            let a = input[base * channels + ch];
            let b = input[next * channels + ch];
            out.push(a + (b - a) * frac);
        }
    }
    out
}

/// Fills the audio sink's buffers from the decoded-frame ring.
pub struct AudioRenderer {
    session: Arc<Session>,
    pipe: Arc<StreamPipe>,
    channels: usize,
    rate: u32,
    /// Estimated sink latency, subtracted from the clock so it tracks
    /// what the listener hears rather than what was queued.
    latency: f64,
    staging: Vec<f32>,
    staging_pos: usize,
    /// Media time at the *end* of the staged data; NaN while unknown.
    staging_end_pts: f64,
    staging_serial: i32,
    diff_cum: f64,
    diff_avg_coef: f64,
    diff_avg_count: u32,
    /// Corrections smaller than this are jitter, not drift.
    diff_threshold: f64,
}

impl AudioRenderer {
    pub fn new(
        session: Arc<Session>,
        pipe: Arc<StreamPipe>,
        rate: u32,
        channels: u16,
        latency: f64,
    ) -> Self {
        Self {
            session,
            pipe,
            channels: usize::from(channels),
            rate,
            latency,
            staging: Vec::new(),
            staging_pos: 0,
            staging_end_pts: f64::NAN,
            staging_serial: -1,
            diff_cum: 0.0,
            // exp(ln(0.01) / N): a drift impulse decays to 1 % over N fills.
            diff_avg_coef: 0.01f64.powf(1.0 / f64::from(AUDIO_DIFF_AVG_NB)),
            diff_avg_count: 0,
            diff_threshold: latency,
        }
    }

    /// The sink callback. Fills `out` completely, with silence where no
    /// media is available, then republishes the audio clock.
    pub fn render(&mut self, out: &mut [f32]) {
        let callback_time = wall_time();
        let mut filled = 0;
        while filled < out.len() {
            if self.staging_pos >= self.staging.len() && !self.refill() {
                out[filled..].fill(0.0);
                filled = out.len();
                break;
            }
            let n = (out.len() - filled).min(self.staging.len() - self.staging_pos);
            out[filled..filled + n]
                .copy_from_slice(&self.staging[self.staging_pos..self.staging_pos + n]);
            self.staging_pos += n;
            filled += n;
        }

        if !self.staging_end_pts.is_nan() {
            let buffered = (self.staging.len() - self.staging_pos) as f64
                / (self.rate as f64 * self.channels as f64);
            self.session.audio_clock.set_at(
                self.staging_end_pts - self.latency - buffered,
                self.staging_serial,
                callback_time,
            );
            self.session
                .external_clock
                .sync_to_slave(&self.session.audio_clock);
        }
    }

    /// Pulls the next current-epoch frame into staging. Returns false
    /// when paused or starved.
    fn refill(&mut self) -> bool {
        if self.session.is_paused() {
            return false;
        }
        loop {
            let Some(frame) = self.pipe.frames.peek_current() else {
                return false;
            };
            if frame.serial != self.pipe.packets.serial() {
                self.pipe.frames.advance();
                continue;
            }
            self.pipe.frames.advance();
            let DecodedPayload::Audio(ref samples) = *frame.payload else {
                continue;
            };
            let in_frames = samples.frames();
            if in_frames == 0 {
                continue;
            }
            let wanted = self.synchronize(in_frames);
            if wanted != in_frames {
                trace!(in_frames, wanted, "audio drift correction");
                self.staging = stretch_samples(&samples.samples, self.channels, wanted);
            } else {
                self.staging = samples.samples.clone();
            }
            self.staging_pos = 0;
            self.staging_end_pts = if frame.pts.is_nan() {
                f64::NAN
            } else {
                frame.pts + in_frames as f64 / f64::from(self.rate.max(1))
            };
            self.staging_serial = frame.serial;
            return true;
        }
    }

    /// Picks how many samples the next fill should consume so the audio
    /// position creeps toward the master clock. Identity when audio is
    /// the master.
    fn synchronize(&mut self, in_frames: usize) -> usize {
        if self.session.sync_mode == SyncMode::AudioMaster {
            return in_frames;
        }
        let diff = self.session.audio_clock.get() - self.session.master_clock();
        if diff.is_finite() && diff.abs() < AV_NOSYNC_THRESHOLD {
            self.diff_cum = diff + self.diff_avg_coef * self.diff_cum;
            if self.diff_avg_count < AUDIO_DIFF_AVG_NB {
                // Still warming up the estimate.
                self.diff_avg_count += 1;
            } else {
                let avg = self.diff_cum * (1.0 - self.diff_avg_coef);
                if avg.abs() >= self.diff_threshold {
                    let wanted = in_frames as f64 + diff * f64::from(self.rate);
                    let min = in_frames * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100;
                    let max = in_frames * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100;
                    return (wanted as isize).clamp(min as isize, max as isize) as usize;
                }
            }
        } else {
            // Way out of sync; correction is hopeless, start over.
            self.diff_cum = 0.0;
            self.diff_avg_count = 0;
        }
        in_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::AudioSamples;
    use crate::playback::player::test_support;
    use crate::queue::Frame;
    use crate::signal::Notifier;

    #[test]
    fn test_stretch_identity_when_counts_match() {
        let input = vec![0.0, 1.0, 0.5, 0.25];
        assert_eq!(stretch_samples(&input, 2, 2), input);
    }

    #[test]
    fn test_stretch_preserves_endpoints() {
        let input: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let out = stretch_samples(&input, 1, 15);
        assert_eq!(out.len(), 15);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[14] - 9.0).abs() < 1e-6);
        // Monotone input stays monotone under linear interpolation.
        for pair in out.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn test_stretch_interleaved_keeps_channels_separate() {
        // Left channel constant 1.0, right channel constant -1.0.
        let input = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let out = stretch_samples(&input, 2, 5);
        for frame in out.chunks_exact(2) {
            assert!((frame[0] - 1.0).abs() < 1e-6);
            assert!((frame[1] + 1.0).abs() < 1e-6);
        }
    }

    fn audio_frame(pts: f64, serial: i32, frames: usize) -> Frame {
        Frame {
            payload: std::sync::Arc::new(DecodedPayload::Audio(AudioSamples {
                rate: 1000,
                channels: 1,
                samples: (0..frames).map(|i| i as f32 / frames as f32).collect(),
            })),
            pts,
            duration: frames as f64 / 1000.0,
            serial,
        }
    }

    fn renderer() -> (AudioRenderer, Arc<StreamPipe>, Arc<Session>) {
        let pipe = Arc::new(StreamPipe::new(0, 8, true, 0.001, Arc::new(Notifier::new())));
        let session = Arc::new(test_support::session_with_audio(Arc::clone(&pipe)));
        pipe.packets.start();
        let renderer = AudioRenderer::new(Arc::clone(&session), Arc::clone(&pipe), 1000, 1, 0.0);
        (renderer, pipe, session)
    }

    #[test]
    fn test_render_fills_silence_when_starved() {
        let (mut renderer, _pipe, _session) = renderer();
        let mut out = vec![1.0f32; 64];
        renderer.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_render_fills_silence_while_paused() {
        let (mut renderer, pipe, session) = renderer();
        let serial = pipe.packets.serial();
        pipe.frames.try_push(audio_frame(0.0, serial, 64));
        session.toggle_pause();
        let mut out = vec![1.0f32; 64];
        renderer.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(pipe.frames.remaining(), 1);
    }

    #[test]
    fn test_render_consumes_frames_and_sets_clock() {
        let (mut renderer, pipe, session) = renderer();
        let serial = pipe.packets.serial();
        pipe.frames.try_push(audio_frame(2.0, serial, 64));
        let mut out = vec![0.0f32; 64];
        renderer.render(&mut out);
        assert!((out[63] - 63.0 / 64.0).abs() < 1e-6);
        // Clock lands at frame end (2.0 + 64 ms), nothing left buffered.
        let clock = session.audio_clock.get();
        assert!((clock - 2.064).abs() < 0.05, "clock was {clock}");
        assert_eq!(session.audio_clock.serial(), serial);
        // External clock adopted the audio position.
        assert!((session.external_clock.get() - clock).abs() < 0.05);
    }

    #[test]
    fn test_stale_frames_skipped_on_refill() {
        let (mut renderer, pipe, _session) = renderer();
        let old_serial = pipe.packets.serial();
        pipe.frames.try_push(audio_frame(0.0, old_serial, 8));
        pipe.packets.push_flush();
        let new_serial = pipe.packets.serial();
        pipe.frames.try_push(audio_frame(5.0, new_serial, 8));
        let mut out = vec![0.0f32; 8];
        renderer.render(&mut out);
        assert_eq!(renderer.staging_serial, new_serial);
    }

    #[test]
    fn test_synchronize_is_identity_for_audio_master() {
        let (mut renderer, _pipe, _session) = renderer();
        assert_eq!(renderer.synchronize(1000), 1000);
    }

    fn external_renderer() -> (AudioRenderer, Arc<StreamPipe>, Arc<Session>) {
        let pipe = Arc::new(StreamPipe::new(0, 8, true, 0.001, Arc::new(Notifier::new())));
        let session = Arc::new(test_support::external_session_with_audio(Arc::clone(&pipe)));
        pipe.packets.start();
        let renderer = AudioRenderer::new(Arc::clone(&session), Arc::clone(&pipe), 1000, 1, 0.0);
        (renderer, pipe, session)
    }

    #[test]
    fn test_synchronize_clamps_correction_to_ten_percent() {
        // Audio a full second ahead of the external master.
        let (mut renderer, pipe, session) = external_renderer();
        session.audio_clock.set(5.0, pipe.packets.serial());
        session.external_clock.set(4.0, 0);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(renderer.synchronize(1000), 1000);
        }
        // One second of drift asks for 1000 extra samples; the correction
        // is capped at 10 % of the fill.
        assert_eq!(renderer.synchronize(1000), 1100);

        // Symmetrically when audio lags.
        let (mut renderer, pipe, session) = external_renderer();
        session.audio_clock.set(4.0, pipe.packets.serial());
        session.external_clock.set(5.0, 0);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(renderer.synchronize(1000), 1000);
        }
        assert_eq!(renderer.synchronize(1000), 900);
    }

    #[test]
    fn test_synchronize_resets_estimate_on_discontinuity() {
        let (mut renderer, pipe, session) = external_renderer();
        session.audio_clock.set(5.0, pipe.packets.serial());
        session.external_clock.set(4.0, 0);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            renderer.synchronize(1000);
        }
        // A jump past the no-sync threshold throws the warm estimate away.
        session.external_clock.set(100.0, 0);
        assert_eq!(renderer.synchronize(1000), 1000);
        assert_eq!(renderer.diff_avg_count, 0);
        // Back in range, the warm-up starts over.
        session.external_clock.set(4.0, 0);
        assert_eq!(renderer.synchronize(1000), 1000);
        assert_eq!(renderer.diff_avg_count, 1);
    }
}
