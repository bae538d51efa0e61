//! Reader thread: sole owner of the demux cursor.
//!
//! Pulls packets from the demuxer and routes them to the per-stream
//! packet queues, applying backpressure once the queues are well fed.
//! Seeks, pause forwarding, end-of-stream markers and loop restarts all
//! happen here because they all need the cursor.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::media::{Demuxer, MediaPacket, ReadOutcome, SeekTarget, StreamInfo};
use crate::playback::state::{SeekRequest, Session, StreamPipe};
use crate::queue::{PacketData, MAX_PACKET_QUEUE_BYTES};

/// How long the reader naps when blocked on backpressure or EOS.
const READER_WAIT: Duration = Duration::from_millis(10);

/// Seek-window bias, in seconds (or bytes for byte seeks): the bound on
/// the side the user came from sits two units past the undone delta, so
/// the demuxer cannot land us back where we started.
const SEEK_WINDOW_BIAS: f64 = 2.0;

fn seek_window(request: &SeekRequest) -> SeekTarget {
    let mut min = f64::MIN;
    let mut max = f64::MAX;
    if request.delta > 0.0 {
        min = request.target - request.delta + SEEK_WINDOW_BIAS;
    } else if request.delta < 0.0 {
        max = request.target - request.delta - SEEK_WINDOW_BIAS;
    }
    SeekTarget {
        target_secs: request.target,
        min_secs: min,
        max_secs: max,
        by_bytes: request.by_bytes,
    }
}

fn within_play_range(session: &Session, info: &StreamInfo, packet: &MediaPacket) -> bool {
    let Some(limit) = session.settings.play_duration else {
        return true;
    };
    let Some(ts) = packet.timestamp() else {
        return true;
    };
    let start = info.start_time.unwrap_or(0);
    let position =
        (ts - start) as f64 * info.time_base - session.settings.start_time.unwrap_or(0.0);
    position <= limit
}

fn flush_for_seek(session: &Session, request: &SeekRequest) {
    for pipe in [&session.audio, &session.video].into_iter().flatten() {
        pipe.packets.flush();
        pipe.packets.push_flush();
    }
    if request.by_bytes {
        // Byte positions say nothing about time; the clock re-learns it
        // from the first decoded frames.
        session.external_clock.set(f64::NAN, 0);
    } else {
        session.external_clock.set(request.target, 0);
    }
}

fn pipe_for(session: &Session, stream_index: usize) -> Option<&Arc<StreamPipe>> {
    [&session.audio, &session.video]
        .into_iter()
        .flatten()
        .find(|pipe| pipe.stream_index == stream_index)
}

/// Body of the reader thread. Returns when the session stops or
/// playback completes with auto-exit.
pub fn run_reader(session: Arc<Session>, mut demuxer: Box<dyn Demuxer>) {
    let stream_infos: Vec<StreamInfo> = demuxer.streams().to_vec();
    let mut last_paused = false;

    loop {
        if session.is_stopped() {
            break;
        }

        let paused = session.is_paused();
        if paused != last_paused {
            last_paused = paused;
            if paused {
                demuxer.pause();
            } else {
                demuxer.resume();
            }
        }

        let pending_seek = session.seek.lock().take();
        if let Some(request) = pending_seek {
            match demuxer.seek(&seek_window(&request)) {
                Ok(()) => {
                    debug!(to = request.target, by_bytes = request.by_bytes, "seek done");
                    flush_for_seek(&session, &request);
                    session.eof.store(false, Ordering::Release);
                    if session.is_paused() {
                        session.step_to_next_frame();
                    }
                }
                Err(e) => error!("seek to {} failed: {e}", request.target),
            }
            continue;
        }

        // Backpressure: stop pulling once the queues hold 16 MiB or every
        // stream is comfortably buffered.
        let wake = session.reader_wake.token();
        if !session.infinite_buffer() {
            let queued_bytes: usize = [&session.audio, &session.video]
                .into_iter()
                .flatten()
                .map(|pipe| pipe.packets.size())
                .sum();
            let all_fed = [&session.audio, &session.video]
                .into_iter()
                .flatten()
                .all(|pipe| pipe.has_enough_packets());
            if queued_bytes > MAX_PACKET_QUEUE_BYTES || all_fed {
                session.reader_wake.wait(wake, READER_WAIT);
                continue;
            }
        }

        // Playback ran out: restart if loops remain, otherwise idle or
        // exit.
        let all_finished = [&session.audio, &session.video]
            .into_iter()
            .flatten()
            .all(|pipe| pipe.finished());
        if !session.is_paused() && all_finished && session.eof.load(Ordering::Acquire) {
            let remaining = session.loops_remaining.load(Ordering::Acquire);
            if remaining != 0 {
                if remaining > 0 {
                    session.loops_remaining.store(remaining - 1, Ordering::Release);
                }
                let start = session.settings.start_time.unwrap_or(0.0);
                info!("restarting playback at {start}s");
                session.request_seek(SeekRequest {
                    target: start,
                    delta: 0.0,
                    by_bytes: false,
                });
                continue;
            }
            if session.settings.auto_exit {
                info!("playback finished");
                session.stop();
                break;
            }
        }

        match demuxer.read_packet() {
            Ok(ReadOutcome::Packet(packet)) => {
                let Some(pipe) = pipe_for(&session, packet.stream_index) else {
                    continue;
                };
                let info = stream_infos
                    .iter()
                    .find(|info| info.index == packet.stream_index);
                let in_range = info
                    .map(|info| within_play_range(&session, info, &packet))
                    .unwrap_or(true);
                if in_range {
                    pipe.packets.push(PacketData::Media(packet));
                }
            }
            Ok(ReadOutcome::Eof) => {
                if !session.eof.swap(true, Ordering::AcqRel) {
                    // One null per stream lets the decoders drain their
                    // codecs exactly once per epoch.
                    for pipe in [&session.audio, &session.video].into_iter().flatten() {
                        pipe.packets.push_null(pipe.stream_index);
                    }
                }
                session.reader_wake.wait(wake, READER_WAIT);
            }
            Err(e) => {
                // A hard read error is fatal for the cursor; let the
                // decoders drain what they have and give up on the
                // source (a loop restart would just fail again).
                error!("read failed: {e}");
                if !session.eof.swap(true, Ordering::AcqRel) {
                    for pipe in [&session.audio, &session.video].into_iter().flatten() {
                        pipe.packets.push_null(pipe.stream_index);
                    }
                }
                break;
            }
        }
    }
    debug!("reader thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_seek_window_bounds_min() {
        let window = seek_window(&SeekRequest {
            target: 60.0,
            delta: 10.0,
            by_bytes: false,
        });
        assert!((window.min_secs - 52.0).abs() < 1e-9);
        assert_eq!(window.max_secs, f64::MAX);
    }

    #[test]
    fn test_backward_seek_window_bounds_max() {
        let window = seek_window(&SeekRequest {
            target: 40.0,
            delta: -10.0,
            by_bytes: false,
        });
        assert_eq!(window.min_secs, f64::MIN);
        assert!((window.max_secs - 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_absolute_seek_window_is_unbounded() {
        let window = seek_window(&SeekRequest {
            target: 40.0,
            delta: 0.0,
            by_bytes: false,
        });
        assert_eq!(window.min_secs, f64::MIN);
        assert_eq!(window.max_secs, f64::MAX);
    }
}
