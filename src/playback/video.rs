//! Video refresh loop.
//!
//! Runs on the caller's thread: each tick decides whether the queued
//! picture should go up now, later (reporting how much later), or not at
//! all because playback already moved past it. Sits out entirely while
//! nothing changed, which is what keeps pause cheap.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::clock::{
    AV_SYNC_FRAMEDUP_THRESHOLD, AV_SYNC_THRESHOLD_MAX, AV_SYNC_THRESHOLD_MIN,
    EXTERNAL_CLOCK_MAX_FRAMES, EXTERNAL_CLOCK_MIN_FRAMES, EXTERNAL_CLOCK_SPEED_MAX,
    EXTERNAL_CLOCK_SPEED_MIN, EXTERNAL_CLOCK_SPEED_STEP, SyncMode, wall_time,
};
use crate::playback::state::{Session, StreamPipe};
use crate::queue::Frame;
use crate::sink::VideoSink;

/// How long the display of the frame that just played should last, given
/// how far the video clock has diverged from the master. `delay` is the
/// nominal inter-frame duration, `diff` is video minus master.
pub fn compute_target_delay(delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    // The tolerance scales with the frame duration but stays inside a
    // fixed band.
    let sync_threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);
    if !diff.is_finite() || diff.abs() >= max_frame_duration {
        return delay;
    }
    if diff <= -sync_threshold {
        // Behind: shorten, possibly to zero.
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
        // Ahead with a long frame: absorb the full difference.
        delay + diff
    } else if diff >= sync_threshold {
        // Ahead with a short frame: double up rather than stall.
        2.0 * delay
    } else {
        delay
    }
}

/// Presentation span between two queued frames. Falls back to the
/// declared duration across epochs or when the pts delta is implausible.
pub fn frame_span(current: &Frame, next: &Frame, max_frame_duration: f64) -> f64 {
    if current.serial != next.serial {
        return 0.0;
    }
    let span = next.pts - current.pts;
    if !span.is_finite() || span <= 0.0 || span > max_frame_duration {
        current.duration
    } else {
        span
    }
}

/// Drives presentation of one video stream.
pub struct VideoLoop {
    session: Arc<Session>,
    pipe: Arc<StreamPipe>,
}

impl VideoLoop {
    pub fn new(session: Arc<Session>, pipe: Arc<StreamPipe>) -> Self {
        Self { session, pipe }
    }

    /// Nudges the external clock's speed so the queues neither drain nor
    /// overflow. Only meaningful for real-time sources.
    fn adjust_external_clock_speed(&self) {
        let session = &self.session;
        let video_low = session
            .video
            .as_ref()
            .is_some_and(|p| p.packets.len() <= EXTERNAL_CLOCK_MIN_FRAMES);
        let audio_low = session
            .audio
            .as_ref()
            .is_some_and(|p| p.packets.len() <= EXTERNAL_CLOCK_MIN_FRAMES);
        let video_high = session
            .video
            .as_ref()
            .map_or(true, |p| p.packets.len() > EXTERNAL_CLOCK_MAX_FRAMES);
        let audio_high = session
            .audio
            .as_ref()
            .map_or(true, |p| p.packets.len() > EXTERNAL_CLOCK_MAX_FRAMES);

        let speed = session.external_clock.speed();
        if video_low || audio_low {
            session
                .external_clock
                .set_speed(EXTERNAL_CLOCK_SPEED_MIN.max(speed - EXTERNAL_CLOCK_SPEED_STEP));
        } else if video_high && audio_high {
            session
                .external_clock
                .set_speed(EXTERNAL_CLOCK_SPEED_MAX.min(speed + EXTERNAL_CLOCK_SPEED_STEP));
        } else if speed != 1.0 {
            // Drift back toward nominal speed.
            session.external_clock.set_speed(
                speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs(),
            );
        }
    }

    fn publish_video_clock(&self, pts: f64, serial: i32) {
        self.session.video_clock.set(pts, serial);
        self.session
            .external_clock
            .sync_to_slave(&self.session.video_clock);
    }

    /// One refresh tick. Lowers `remaining` to the time until the next
    /// frame is due when that is sooner than the caller's default.
    pub fn refresh(&self, sink: &mut dyn VideoSink, remaining: &mut f64) {
        let session = &self.session;

        if !session.is_paused() && session.sync_mode == SyncMode::External && session.realtime {
            self.adjust_external_clock_speed();
        }

        loop {
            if self.pipe.frames.remaining() == 0 {
                break;
            }
            let Some(current) = self.pipe.frames.peek_current() else {
                break;
            };
            if current.serial != self.pipe.packets.serial() {
                // Flushed epoch; never display.
                self.pipe.frames.advance();
                continue;
            }
            let last = self.pipe.frames.peek_last();
            if last.as_ref().map(|f| f.serial) != Some(current.serial) {
                session.frame_timer.store(wall_time());
            }

            if session.is_paused() {
                break;
            }

            let nominal = last
                .as_ref()
                .map(|f| frame_span(f, &current, session.max_frame_duration))
                .unwrap_or(0.0);
            let diff = if session.sync_mode == SyncMode::VideoMaster {
                0.0
            } else {
                session.video_clock.get() - session.master_clock()
            };
            let delay = compute_target_delay(nominal, diff, session.max_frame_duration);

            let now = wall_time();
            let frame_timer = session.frame_timer.load();
            if now < frame_timer + delay {
                *remaining = (frame_timer + delay - now).min(*remaining);
                break;
            }

            session.frame_timer.store(frame_timer + delay);
            if delay > 0.0 && now - (frame_timer + delay) > AV_SYNC_THRESHOLD_MAX {
                // The timer fell hopelessly behind wall time; resync.
                session.frame_timer.store(now);
            }

            if !current.pts.is_nan() {
                self.publish_video_clock(current.pts, current.serial);
            }

            // Already past the *next* frame too? Drop instead of showing
            // a picture whose time has gone.
            if let Some(next) = self.pipe.frames.peek_next() {
                let span = frame_span(&current, &next, session.max_frame_duration);
                let stepping = session.step.load(Ordering::Acquire);
                if !stepping
                    && session.settings.drop_late_frames
                    && session.sync_mode != SyncMode::VideoMaster
                    && wall_time() > session.frame_timer.load() + span
                {
                    session.late_drops.fetch_add(1, Ordering::Relaxed);
                    trace!(pts = current.pts, "dropping late frame");
                    self.pipe.frames.advance();
                    continue;
                }
            }

            self.pipe.frames.advance();
            session.force_refresh.store(true, Ordering::Release);

            if session.step.load(Ordering::Acquire) && !session.is_paused() {
                session.toggle_pause();
            }
            break;
        }

        if session.force_refresh.swap(false, Ordering::AcqRel) && self.pipe.frames.is_head_shown() {
            if let Some(frame) = self.pipe.frames.peek_last() {
                sink.display(&frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{DecodedPayload, VideoPixels};

    const MAX_FRAME_DURATION: f64 = 10.0;

    #[test]
    fn test_delay_unchanged_inside_tolerance() {
        let delay = compute_target_delay(0.04, 0.01, MAX_FRAME_DURATION);
        assert!((delay - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_delay_shortened_when_video_behind() {
        // diff = -0.06 against a 40 ms frame: show the next one sooner.
        let delay = compute_target_delay(0.04, -0.06, MAX_FRAME_DURATION);
        assert!(delay.abs() < 1e-9);
        // Small lag still above threshold shortens without pinning at 0.
        let delay = compute_target_delay(0.04, -0.041, MAX_FRAME_DURATION);
        assert!(delay > 0.0 && delay < 0.04);
    }

    #[test]
    fn test_delay_doubled_for_short_frames_ahead() {
        let delay = compute_target_delay(0.04, 0.05, MAX_FRAME_DURATION);
        assert!((delay - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_delay_absorbs_diff_for_long_frames_ahead() {
        // 200 ms frame, 150 ms ahead: hold the frame the extra time.
        let delay = compute_target_delay(0.2, 0.15, MAX_FRAME_DURATION);
        assert!((delay - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_huge_divergence_leaves_delay_alone() {
        let delay = compute_target_delay(0.04, 20.0, MAX_FRAME_DURATION);
        assert!((delay - 0.04).abs() < 1e-9);
        let delay = compute_target_delay(0.04, f64::NAN, MAX_FRAME_DURATION);
        assert!((delay - 0.04).abs() < 1e-9);
    }

    fn video_frame(pts: f64, duration: f64, serial: i32) -> Frame {
        Frame {
            payload: std::sync::Arc::new(DecodedPayload::Video(VideoPixels {
                width: 2,
                height: 2,
                data: vec![0; 16],
            })),
            pts,
            duration,
            serial,
        }
    }

    #[test]
    fn test_frame_span_uses_pts_delta_within_epoch() {
        let a = video_frame(1.00, 0.04, 7);
        let b = video_frame(1.05, 0.04, 7);
        assert!((frame_span(&a, &b, MAX_FRAME_DURATION) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_frame_span_across_epochs_is_zero() {
        let a = video_frame(1.00, 0.04, 7);
        let b = video_frame(9.00, 0.04, 8);
        assert_eq!(frame_span(&a, &b, MAX_FRAME_DURATION), 0.0);
    }

    #[test]
    fn test_frame_span_rejects_implausible_delta() {
        let a = video_frame(1.0, 0.04, 7);
        let discontinuity = video_frame(500.0, 0.04, 7);
        assert!((frame_span(&a, &discontinuity, MAX_FRAME_DURATION) - 0.04).abs() < 1e-9);
        let backwards = video_frame(0.5, 0.04, 7);
        assert!((frame_span(&a, &backwards, MAX_FRAME_DURATION) - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_refresh_drops_frame_whose_time_has_gone() {
        let pipe = Arc::new(StreamPipe::new(
            0,
            4,
            true,
            0.001,
            Arc::new(crate::signal::Notifier::new()),
        ));
        let session = Arc::new(
            crate::playback::player::test_support::session_with_video(Arc::clone(&pipe)),
        );
        pipe.packets.start();
        let serial = pipe.packets.serial();
        // Master way ahead of the stream: every frame computes a zero
        // delay and only the wall-clock gate decides what gets shown.
        session.external_clock.set(5.0, 0);
        for pts in [0.0, 0.04, 0.08] {
            assert!(pipe
                .frames
                .try_push(video_frame(pts, 0.04, serial))
                .is_none());
        }
        // Timer anchored well in the past so the first frame is overdue
        // and goes up on the first tick.
        session.frame_timer.store(wall_time() - 1.0);

        let video_loop = VideoLoop::new(Arc::clone(&session), Arc::clone(&pipe));
        let mut sink = crate::sink::NullVideoSink::new();
        let mut remaining = 0.01;
        video_loop.refresh(&mut sink, &mut remaining);
        assert_eq!(sink.frames_displayed, 1);
        assert_eq!(sink.last_pts, Some(0.0));

        // By the next tick two more frames are due at once; the middle
        // one is dropped rather than shown after its time.
        std::thread::sleep(std::time::Duration::from_millis(100));
        video_loop.refresh(&mut sink, &mut remaining);
        assert_eq!(session.late_drops.load(Ordering::Relaxed), 1);
        assert_eq!(sink.frames_displayed, 2);
        assert_eq!(sink.last_pts, Some(0.08));
    }
}
