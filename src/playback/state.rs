//! Shared playback state and configuration.
//!
//! All cross-thread state lives in one explicitly shared [`Session`]
//! owned by the player and handed to the worker threads behind an `Arc`.
//! Flags are plain atomics; the only mutex-guarded field is the pending
//! seek request.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;

use crate::clock::{Clock, SyncMode};
use crate::queue::{FrameQueue, PacketQueue};
use crate::signal::Notifier;

/// Player configuration, fixed at open time.
#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub sync_mode: SyncMode,
    /// Extra restarts after the stream ends: 0 = play once, -1 = forever.
    pub loop_count: i32,
    /// Stop the session once playback finishes (and looping is done).
    pub auto_exit: bool,
    /// Start position in seconds from the beginning of the media.
    pub start_time: Option<f64>,
    /// Restrict playback to this many seconds; later packets are dropped.
    pub play_duration: Option<f64>,
    /// Trust ffmpeg's reconstructed frame timestamps over raw pts.
    pub use_best_effort_pts: bool,
    /// Disable read backpressure; forced on for real-time sources.
    pub infinite_buffer: Option<bool>,
    /// Drop late video frames when not synced to the video clock.
    pub drop_late_frames: bool,
    /// Seek by byte position instead of timestamps; `None` lets the
    /// container decide.
    pub seek_by_bytes: Option<bool>,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::AudioMaster,
            loop_count: 0,
            auto_exit: false,
            start_time: None,
            play_duration: None,
            use_best_effort_pts: true,
            infinite_buffer: None,
            drop_late_frames: true,
            seek_by_bytes: None,
        }
    }
}

/// One pending seek. `target` and `delta` are seconds, or byte positions
/// when `by_bytes` is set. `delta` biases the demuxer's seek window
/// toward the side the user came from.
#[derive(Debug, Clone, Copy)]
pub struct SeekRequest {
    pub target: f64,
    pub delta: f64,
    pub by_bytes: bool,
}

/// Picks the clock that can actually be the master given which streams
/// exist, falling back video → audio → external.
pub fn effective_sync_mode(requested: SyncMode, has_audio: bool, has_video: bool) -> SyncMode {
    match requested {
        SyncMode::VideoMaster if has_video => SyncMode::VideoMaster,
        SyncMode::VideoMaster | SyncMode::AudioMaster if has_audio => SyncMode::AudioMaster,
        _ => SyncMode::External,
    }
}

/// Queues and bookkeeping for one elementary stream.
pub struct StreamPipe {
    pub stream_index: usize,
    pub packets: PacketQueue,
    pub frames: FrameQueue,
    /// Seconds per packet-duration tick, for the buffered-duration check.
    pub time_base: f64,
    /// Serial of the epoch whose tail the decoder has fully drained;
    /// 0 while decoding is still producing.
    pub finished_serial: AtomicI32,
    /// Wakes the decoder thread (new packets, stop).
    pub decoder_wake: Arc<Notifier>,
}

impl StreamPipe {
    pub fn new(
        stream_index: usize,
        frame_capacity: usize,
        keep_last: bool,
        time_base: f64,
        reader_wake: Arc<Notifier>,
    ) -> Self {
        let decoder_wake = Arc::new(Notifier::new());
        Self {
            stream_index,
            packets: PacketQueue::new(Arc::clone(&decoder_wake), Arc::clone(&reader_wake)),
            frames: FrameQueue::new(frame_capacity, keep_last, Arc::clone(&decoder_wake)),
            time_base,
            finished_serial: AtomicI32::new(0),
            decoder_wake,
        }
    }

    /// Whether this stream has played out every queued packet and frame
    /// of the current epoch.
    pub fn finished(&self) -> bool {
        self.finished_serial.load(Ordering::Acquire) == self.packets.serial()
            && self.frames.remaining() == 0
    }

    /// Reader backpressure test: a stream is well fed once it holds more
    /// than 25 packets covering over a second of media (or it cannot
    /// accept packets at all).
    pub fn has_enough_packets(&self) -> bool {
        const MIN_PACKET_FRAMES: usize = 25;
        if !self.packets.is_started() {
            return true;
        }
        self.packets.len() > MIN_PACKET_FRAMES
            && (self.packets.duration() == 0
                || self.packets.duration() as f64 * self.time_base > 1.0)
    }
}

/// Everything the worker threads share.
pub struct Session {
    pub settings: PlayerSettings,
    pub sync_mode: SyncMode,
    pub audio: Option<Arc<StreamPipe>>,
    pub video: Option<Arc<StreamPipe>>,
    pub audio_clock: Clock,
    pub video_clock: Clock,
    pub external_clock: Clock,
    /// Wakes the reader (queue space freed, seek requested, stop).
    pub reader_wake: Arc<Notifier>,

    pub paused: AtomicBool,
    pub stopped: AtomicBool,
    /// Advance exactly one frame, then pause again.
    pub step: AtomicBool,
    /// Redisplay the current frame even if no new one is due.
    pub force_refresh: AtomicBool,
    pub eof: AtomicBool,
    pub seek: Mutex<Option<SeekRequest>>,
    pub loops_remaining: AtomicI32,

    /// Wall time the current video frame went up. Refresh loop only.
    pub frame_timer: AtomicCell<f64>,
    pub early_drops: AtomicU64,
    pub late_drops: AtomicU64,

    pub realtime: bool,
    pub max_frame_duration: f64,
    pub media_start_time: Option<f64>,
    pub media_duration: Option<f64>,
    /// Frame rate of the master stream, for progress estimates.
    pub master_frame_rate: Option<f64>,
}

impl Session {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Signals every thread to wind down.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.reader_wake.notify();
        for pipe in [&self.audio, &self.video].into_iter().flatten() {
            pipe.packets.abort();
            pipe.frames.stop();
        }
    }

    /// Reads the authoritative clock for the active sync mode.
    pub fn master_clock(&self) -> f64 {
        match self.sync_mode {
            SyncMode::AudioMaster => self.audio_clock.get(),
            SyncMode::VideoMaster => self.video_clock.get(),
            SyncMode::External => self.external_clock.get(),
        }
    }

    /// Buffering is unbounded for real-time sources unless overridden.
    pub fn infinite_buffer(&self) -> bool {
        self.settings.infinite_buffer.unwrap_or(self.realtime)
    }

    pub fn request_seek(&self, request: SeekRequest) {
        let mut slot = self.seek.lock();
        // A seek still in flight wins; matching the one-at-a-time policy.
        if slot.is_none() {
            *slot = Some(request);
            self.reader_wake.notify();
        }
    }

    /// Pauses or resumes, re-anchoring the clocks so no wall time spent
    /// paused leaks into the position.
    pub fn toggle_pause(&self) {
        let was_paused = self.paused.load(Ordering::Acquire);
        if was_paused {
            // Fold the pause gap into the frame timer before resuming.
            let now = crate::clock::wall_time();
            let timer = self.frame_timer.load();
            self.frame_timer
                .store(timer + now - self.video_clock.last_updated());
            self.video_clock
                .set(self.video_clock.get(), self.video_clock.serial());
        }
        let paused = !was_paused;
        self.external_clock
            .set(self.external_clock.get(), self.external_clock.serial());
        self.paused.store(paused, Ordering::Release);
        self.audio_clock.set_paused(paused);
        self.video_clock.set_paused(paused);
        self.external_clock.set_paused(paused);
        self.reader_wake.notify();
    }

    /// Resumes if paused and advances exactly one frame; the refresh
    /// loop pauses again once that frame is up.
    pub fn step_to_next_frame(&self) {
        if self.is_paused() {
            self.toggle_pause();
        }
        self.step.store(true, Ordering::Release);
    }

    /// Position and estimated frame number on the master timeline.
    pub fn progress(&self) -> (f64, Option<u64>) {
        let position = self.master_clock();
        let frame = match (self.master_frame_rate, position.is_nan()) {
            (Some(rate), false) if position >= 0.0 => Some((position * rate) as u64),
            _ => None,
        };
        (position, frame)
    }
}
