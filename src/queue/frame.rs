//! Fixed-capacity decoded-frame ring with keep-last lookbehind.
//!
//! The display side never consumes its newest picture outright: with
//! `keep_last` enabled the first `advance` only marks the head frame as
//! shown, so pause and redisplay can re-read it. `remaining()` therefore
//! reports `count - shown`, the number of not-yet-displayed frames.
//!
//! Payloads are behind an `Arc` so peeks hand out cheap clones instead of
//! copying pixel or sample buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::media::DecodedPayload;
use crate::signal::Notifier;

pub const VIDEO_FRAME_QUEUE_CAPACITY: usize = 4;
pub const AUDIO_FRAME_QUEUE_CAPACITY: usize = 8;

/// One decoded frame ready for presentation. `pts` is NaN when the
/// source carried no usable timestamp.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Arc<DecodedPayload>,
    pub pts: f64,
    pub duration: f64,
    pub serial: i32,
}

struct Ring {
    slots: Vec<Option<Frame>>,
    read_index: usize,
    write_index: usize,
    count: usize,
    /// 1 once the head frame has been displayed (keep-last mode only).
    read_index_shown: usize,
}

/// Single-producer single-consumer frame ring.
pub struct FrameQueue {
    ring: Mutex<Ring>,
    capacity: usize,
    keep_last: bool,
    /// Poked on every push and advance; both sides wait on it.
    changed: Arc<Notifier>,
    stopped: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize, keep_last: bool, changed: Arc<Notifier>) -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                read_index: 0,
                write_index: 0,
                count: 0,
                read_index_shown: 0,
            }),
            capacity,
            keep_last,
            changed,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames queued but not yet displayed.
    pub fn remaining(&self) -> usize {
        let ring = self.ring.lock();
        ring.count - ring.read_index_shown
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Marks the queue stopped and wakes both sides so they can exit.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.changed.notify();
    }

    /// Commits `frame` if a slot is free, otherwise hands it back.
    pub fn try_push(&self, frame: Frame) -> Option<Frame> {
        if self.is_stopped() {
            return Some(frame);
        }
        let mut ring = self.ring.lock();
        if ring.count == self.capacity {
            return Some(frame);
        }
        let write_index = ring.write_index;
        ring.slots[write_index] = Some(frame);
        ring.write_index = (write_index + 1) % self.capacity;
        ring.count += 1;
        drop(ring);
        self.changed.notify();
        None
    }

    /// Oldest not-yet-displayed frame, without consuming it.
    pub fn peek_current(&self) -> Option<Frame> {
        let ring = self.ring.lock();
        if ring.count <= ring.read_index_shown {
            return None;
        }
        ring.slots[(ring.read_index + ring.read_index_shown) % self.capacity].clone()
    }

    /// Frame after the current one, when queued.
    pub fn peek_next(&self) -> Option<Frame> {
        let ring = self.ring.lock();
        if ring.count <= ring.read_index_shown + 1 {
            return None;
        }
        ring.slots[(ring.read_index + ring.read_index_shown + 1) % self.capacity].clone()
    }

    /// Most recently displayed frame (the keep-last slot).
    pub fn peek_last(&self) -> Option<Frame> {
        let ring = self.ring.lock();
        ring.slots[ring.read_index].clone()
    }

    /// Retires the current frame. In keep-last mode the first call only
    /// marks the head frame shown; later calls free the previous one.
    pub fn advance(&self) {
        let mut ring = self.ring.lock();
        if self.keep_last && ring.read_index_shown == 0 {
            ring.read_index_shown = 1;
            return;
        }
        if ring.count == 0 {
            return;
        }
        let read_index = ring.read_index;
        ring.slots[read_index] = None;
        ring.read_index = (read_index + 1) % self.capacity;
        ring.count -= 1;
        drop(ring);
        self.changed.notify();
    }

    /// Whether the head frame has already been displayed.
    pub fn is_head_shown(&self) -> bool {
        self.ring.lock().read_index_shown != 0
    }

    /// Serial of the most recently displayed frame, if any.
    pub fn last_shown_serial(&self) -> Option<i32> {
        let ring = self.ring.lock();
        if ring.read_index_shown == 0 {
            return None;
        }
        ring.slots[ring.read_index].as_ref().map(|f| f.serial)
    }
}
