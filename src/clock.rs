//! Drift-compensated playback clocks.
//!
//! A clock is anchored at a known `pts` at a known wall time and
//! extrapolates from there at the current playback speed, so queries are
//! cheap and speed changes rebase smoothly without re-measuring. Each clock
//! remembers the serial of the discontinuity epoch it was last set from; if
//! its bound packet queue has since been flushed the reading is meaningless
//! and `get` answers NaN.
//!
//! Clocks follow a single-writer discipline (the video clock is written
//! only by the refresh loop, the audio clock only by the audio callback),
//! so the fields are lock-free atomic cells rather than a mutex.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crossbeam::atomic::AtomicCell;

/// No sync correction is attempted below this threshold (seconds).
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// No sync correction is attempted above this threshold (seconds).
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Differences beyond this are treated as a new epoch, not drift (seconds).
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;
/// Frames longer than this are never duplicated to compensate sync.
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

/// External clock speed band for real-time sources.
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// Buffered-packet watermarks steering the external clock speed.
pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;

/// Which stream's clock is authoritative for synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    AudioMaster,
    VideoMaster,
    External,
}

/// Monotonic wall time in seconds since the first call in this process.
pub fn wall_time() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// One playback clock (audio, video or external).
pub struct Clock {
    pts: AtomicCell<f64>,
    pts_drift: AtomicCell<f64>,
    last_updated: AtomicCell<f64>,
    speed: AtomicCell<f64>,
    serial: AtomicI32,
    paused: AtomicBool,
    /// Serial counter of the queue this clock is bound to; a mismatch with
    /// `serial` means the last known position belongs to a flushed epoch.
    queue_serial: Arc<AtomicI32>,
    /// Free-running clocks track their own serial and are never stale.
    owns_serial: bool,
}

impl Clock {
    /// Creates a clock bound to `queue_serial`. Starts out unknown (NaN).
    pub fn new(queue_serial: Arc<AtomicI32>) -> Self {
        let clock = Self {
            pts: AtomicCell::new(f64::NAN),
            pts_drift: AtomicCell::new(f64::NAN),
            last_updated: AtomicCell::new(wall_time()),
            speed: AtomicCell::new(1.0),
            serial: AtomicI32::new(-1),
            paused: AtomicBool::new(false),
            queue_serial,
            owns_serial: false,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    /// Creates a clock whose staleness check tracks its own serial, i.e.
    /// one that is never stale. Used for the external clock.
    pub fn free_running() -> Self {
        let mut clock = Self::new(Arc::new(AtomicI32::new(-1)));
        clock.owns_serial = true;
        clock
    }

    pub fn get(&self) -> f64 {
        self.get_at(wall_time())
    }

    /// Reads the clock at an explicit wall time.
    pub fn get_at(&self, now: f64) -> f64 {
        if self.queue_serial.load(Ordering::Acquire) != self.serial() {
            return f64::NAN;
        }
        if self.paused.load(Ordering::Acquire) {
            self.pts.load()
        } else {
            let speed = self.speed.load();
            self.pts_drift.load() + now - (now - self.last_updated.load()) * (1.0 - speed)
        }
    }

    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, wall_time());
    }

    /// Re-anchors the clock at `pts` as of wall time `at`.
    pub fn set_at(&self, pts: f64, serial: i32, at: f64) {
        self.pts.store(pts);
        self.last_updated.store(at);
        self.pts_drift.store(pts - at);
        self.serial.store(serial, Ordering::Release);
        if self.owns_serial {
            self.queue_serial.store(serial, Ordering::Release);
        }
    }

    /// Changes playback speed, rebasing first so position stays continuous.
    pub fn set_speed(&self, speed: f64) {
        self.set(self.get(), self.serial());
        self.speed.store(speed);
    }

    pub fn speed(&self) -> f64 {
        self.speed.load()
    }

    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    pub fn last_updated(&self) -> f64 {
        self.last_updated.load()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Pulls this clock to `slave`'s reading if the two have diverged more
    /// than the no-sync threshold or this clock is unknown. Bounds
    /// long-term drift while tolerating continuous small jitter.
    pub fn sync_to_slave(&self, slave: &Clock) {
        let own = self.get();
        let theirs = slave.get();
        if !theirs.is_nan() && (own.is_nan() || (own - theirs).abs() > AV_NOSYNC_THRESHOLD) {
            self.set(theirs, slave.serial());
        }
    }
}
