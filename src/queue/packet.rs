//! Per-stream compressed packet queue with discontinuity serials.
//!
//! Every entry carries the serial the queue had when it was pushed. A
//! flush entry bumps the serial, so consumers can tell data from before a
//! seek apart from data after it without any out-of-band signal. Null
//! entries mark end of stream for one stream index.
//!
//! Capacity is enforced by the reader (byte/duration watermarks), not
//! here; the queue itself is unbounded and never blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::media::MediaPacket;
use crate::signal::Notifier;

/// Combined byte ceiling across all packet queues before the reader
/// stops pulling from the demuxer.
pub const MAX_PACKET_QUEUE_BYTES: usize = 16 * 1024 * 1024;

/// Queue entry payload.
#[derive(Debug)]
pub enum PacketData {
    Media(MediaPacket),
    /// Discontinuity marker; bumps the queue serial when pushed.
    Flush,
    /// End-of-stream marker for `stream_index`.
    Null { stream_index: usize },
}

/// One queued entry, stamped with the serial current at push time.
#[derive(Debug)]
pub struct Packet {
    pub data: PacketData,
    pub serial: i32,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<Packet>,
    /// Payload bytes currently queued.
    size: usize,
    /// Sum of packet durations, in stream time-base ticks.
    duration: i64,
    started: bool,
}

/// Serial-stamped packet queue. Producer is the reader thread; consumer
/// is one decoder thread.
pub struct PacketQueue {
    inner: Mutex<Inner>,
    serial: Arc<AtomicI32>,
    /// Poked when an entry arrives; the decoder waits on this.
    added: Arc<Notifier>,
    /// Poked when space frees up; the reader waits on this.
    freed: Arc<Notifier>,
}

impl PacketQueue {
    pub fn new(added: Arc<Notifier>, freed: Arc<Notifier>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            serial: Arc::new(AtomicI32::new(0)),
            added,
            freed,
        }
    }

    /// Current discontinuity serial.
    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    /// Shared handle to the serial counter, for binding a [`crate::Clock`].
    pub fn serial_handle(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.serial)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Queued payload bytes.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Queued duration in stream time-base ticks.
    pub fn duration(&self) -> i64 {
        self.inner.lock().duration
    }

    /// Whether the queue has been primed and not aborted.
    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    /// Primes the queue with a flush entry so the decoder starts in a
    /// known epoch. Call before spawning the consumer.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        inner.started = true;
        self.push_locked(&mut inner, PacketData::Flush);
    }

    pub fn push(&self, data: PacketData) {
        let mut inner = self.inner.lock();
        self.push_locked(&mut inner, data);
    }

    pub fn push_flush(&self) {
        self.push(PacketData::Flush);
    }

    pub fn push_null(&self, stream_index: usize) {
        self.push(PacketData::Null { stream_index });
    }

    fn push_locked(&self, inner: &mut Inner, data: PacketData) {
        let serial = match data {
            // Bump first so the flush entry itself carries the new serial.
            PacketData::Flush => self.serial.fetch_add(1, Ordering::AcqRel) + 1,
            _ => self.serial.load(Ordering::Acquire),
        };
        if let PacketData::Media(ref pkt) = data {
            inner.size += pkt.size();
            inner.duration += pkt.duration;
        }
        inner.entries.push_back(Packet { data, serial });
        self.added.notify();
    }

    /// Pops the oldest entry without blocking.
    pub fn try_pop(&self) -> Option<Packet> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop_front()?;
        if let PacketData::Media(ref pkt) = entry.data {
            inner.size -= pkt.size();
            inner.duration -= pkt.duration;
        }
        self.freed.notify();
        Some(entry)
    }

    /// Drops every queued entry. Does not bump the serial by itself;
    /// follow with [`push_flush`](Self::push_flush) to open a new epoch.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.size = 0;
        inner.duration = 0;
        self.freed.notify();
    }

    /// Flushes and marks the queue stopped so the consumer can exit.
    pub fn abort(&self) {
        {
            let mut inner = self.inner.lock();
            inner.entries.clear();
            inner.size = 0;
            inner.duration = 0;
            inner.started = false;
        }
        self.added.notify();
        self.freed.notify();
    }
}
