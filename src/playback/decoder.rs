//! Decoder threads: packets in, frames out.
//!
//! One thread per stream runs [`run_decoder`]. Each iteration drains the
//! codec first, then feeds it the next queue entry; flush entries reset
//! the codec and open a new epoch, null entries switch it into draining
//! mode. A single pending slot holds a packet the codec transiently
//! refused so nothing is ever lost between iterations.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::clock::AV_NOSYNC_THRESHOLD;
use crate::media::{
    DecodedFrame, DecodedPayload, MediaPacket, ReceiveOutcome, SendOutcome, StreamDecoder,
    StreamKind,
};
use crate::playback::state::{Session, StreamPipe};
use crate::queue::{Frame, PacketData};

/// How long a decoder naps when starved for packets or slots.
const DECODER_WAIT: Duration = Duration::from_millis(10);

/// Outcome of one [`DecodeState::decode_next`] call.
#[derive(Debug)]
pub enum DecodeResult {
    /// A frame of the current epoch, stamped with its packet serial.
    Success(DecodedFrame, i32),
    /// The queue is empty; come back once the reader catches up.
    RequireMorePackets,
    /// The codec drained the current epoch to its end.
    EndOfStream,
    /// A frame surfaced from an epoch that has since been flushed.
    Skipped,
    /// The session is shutting down.
    Stopped,
    /// Unrecoverable codec error.
    Failed,
}

/// Codec driver for one stream.
pub struct DecodeState {
    decoder: Box<dyn StreamDecoder>,
    pipe: Arc<StreamPipe>,
    /// Packet the codec refused with `Again`, retried after draining.
    pending: Option<(MediaPacket, i32)>,
    /// Serial of the epoch the codec is currently decoding.
    pkt_serial: i32,
    /// Predicted pts of the next audio frame, for sources whose frames
    /// carry no timestamps mid-stream.
    next_pts: Option<f64>,
}

impl DecodeState {
    pub fn new(decoder: Box<dyn StreamDecoder>, pipe: Arc<StreamPipe>) -> Self {
        Self {
            decoder,
            pipe,
            pending: None,
            pkt_serial: -1,
            next_pts: None,
        }
    }

    pub fn decode_next(&mut self, session: &Session) -> DecodeResult {
        loop {
            if session.is_stopped() {
                return DecodeResult::Stopped;
            }

            // Drain the codec while it still holds output for the
            // current epoch.
            if self.pkt_serial == self.pipe.packets.serial() {
                match self.decoder.receive() {
                    Ok(ReceiveOutcome::Frame(mut frame)) => {
                        if self.pkt_serial != self.pipe.packets.serial() {
                            return DecodeResult::Skipped;
                        }
                        if let DecodedPayload::Audio(ref samples) = frame.payload {
                            // Gapless prediction: a missing timestamp
                            // continues where the previous frame ended.
                            let pts = frame.pts.or(self.next_pts);
                            frame.pts = pts;
                            self.next_pts = pts.map(|p| {
                                p + samples.frames() as f64 / f64::from(samples.rate.max(1))
                            });
                        }
                        return DecodeResult::Success(frame, self.pkt_serial);
                    }
                    Ok(ReceiveOutcome::NeedsInput) => {}
                    Ok(ReceiveOutcome::EndOfStream) => {
                        self.pipe
                            .finished_serial
                            .store(self.pkt_serial, Ordering::Release);
                        return DecodeResult::EndOfStream;
                    }
                    Err(e) => {
                        error!("decode failed: {e}");
                        return DecodeResult::Failed;
                    }
                }
            }

            // Feed phase: pending packet first, then the queue.
            let entry = if let Some((packet, serial)) = self.pending.take() {
                Some((PacketData::Media(packet), serial))
            } else {
                self.pipe
                    .packets
                    .try_pop()
                    .map(|entry| (entry.data, entry.serial))
            };
            let Some((data, serial)) = entry else {
                return DecodeResult::RequireMorePackets;
            };

            match data {
                PacketData::Flush => {
                    trace!("codec flush, serial {serial}");
                    self.decoder.flush();
                    self.next_pts = None;
                    self.pipe.finished_serial.store(0, Ordering::Release);
                    self.pkt_serial = serial;
                }
                PacketData::Null { .. } => {
                    if serial == self.pipe.packets.serial() {
                        self.pkt_serial = serial;
                        if let Err(e) = self.decoder.send_drain() {
                            error!("drain failed: {e}");
                            return DecodeResult::Failed;
                        }
                    }
                }
                PacketData::Media(packet) => {
                    if serial != self.pipe.packets.serial() {
                        // Leftover from before a flush; the codec never
                        // sees it.
                        continue;
                    }
                    self.pkt_serial = serial;
                    match self.decoder.send(&packet) {
                        Ok(SendOutcome::Accepted) => {}
                        Ok(SendOutcome::Again) => {
                            self.pending = Some((packet, serial));
                        }
                        Err(e) => {
                            error!("send failed: {e}");
                            return DecodeResult::Failed;
                        }
                    }
                }
            }
        }
    }
}

/// Drops video frames that already missed the master clock instead of
/// queueing them. Never fires when video is its own master, and only
/// for frames from the epoch the video clock was last anchored in — a
/// clock left behind by a seek says nothing about the new epoch.
fn should_drop_early(
    session: &Session,
    pipe: &StreamPipe,
    frame: &DecodedFrame,
    serial: i32,
) -> bool {
    if !session.settings.drop_late_frames
        || session.sync_mode == crate::clock::SyncMode::VideoMaster
    {
        return false;
    }
    let Some(pts) = frame.pts else {
        return false;
    };
    let master = session.master_clock();
    if master.is_nan() {
        return false;
    }
    let diff = pts - master;
    diff < 0.0
        && diff > -AV_NOSYNC_THRESHOLD
        && serial == session.video_clock.serial()
        && !pipe.packets.is_empty()
}

/// Blocks until `frame` fits in the ring or the session stops.
fn push_frame(session: &Session, pipe: &StreamPipe, mut frame: Frame) {
    loop {
        let wake = pipe.decoder_wake.token();
        match pipe.frames.try_push(frame) {
            None => return,
            Some(rejected) => {
                if session.is_stopped() || pipe.frames.is_stopped() {
                    return;
                }
                frame = rejected;
                pipe.decoder_wake.wait(wake, DECODER_WAIT);
            }
        }
    }
}

/// Body of one decoder thread.
pub fn run_decoder(session: Arc<Session>, pipe: Arc<StreamPipe>, decoder: Box<dyn StreamDecoder>) {
    let kind = decoder.kind();
    let mut state = DecodeState::new(decoder, Arc::clone(&pipe));
    loop {
        let wake = pipe.decoder_wake.token();
        match state.decode_next(&session) {
            DecodeResult::Success(frame, serial) => {
                if kind == StreamKind::Video && should_drop_early(&session, &pipe, &frame, serial) {
                    session.early_drops.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let queued = Frame {
                    pts: frame.pts.unwrap_or(f64::NAN),
                    duration: frame.duration,
                    serial,
                    payload: Arc::new(frame.payload),
                };
                push_frame(&session, &pipe, queued);
            }
            DecodeResult::RequireMorePackets | DecodeResult::EndOfStream => {
                pipe.decoder_wake.wait(wake, DECODER_WAIT);
            }
            DecodeResult::Skipped => {}
            DecodeResult::Stopped => break,
            DecodeResult::Failed => break,
        }
    }
    debug!(?kind, "decoder thread exiting");
}
