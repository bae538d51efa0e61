//! Demuxer/decoder seam.
//!
//! The pipeline only ever talks to these traits; the ffmpeg-next backed
//! implementation lives in [`ffmpeg`]. Keeping the seam narrow makes the
//! reader/decoder/sync machinery testable against synthetic sources.

pub mod ffmpeg;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to open input: {0}")]
    Open(String),
    #[error("no decodable audio or video stream found")]
    NoStreams,
    #[error("failed to open codec: {0}")]
    CodecOpen(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("read error: {0}")]
    Read(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

/// One compressed packet as handed out by the demuxer. Timestamps are in
/// the originating stream's time base.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub stream_index: usize,
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub is_key: bool,
}

impl MediaPacket {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Best available timestamp (pts falling back to dts), still in
    /// stream time-base ticks.
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

/// Decoded video picture, RGBA8.
#[derive(Debug, Clone)]
pub struct VideoPixels {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Decoded audio block, interleaved f32 already at the sink's format.
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioSamples {
    /// Sample count per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

#[derive(Debug, Clone)]
pub enum DecodedPayload {
    Video(VideoPixels),
    Audio(AudioSamples),
}

/// One frame out of a codec, timestamps converted to seconds. `pts` is
/// `None` when the source carried no usable timestamp.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub payload: DecodedPayload,
    pub pts: Option<f64>,
    pub duration: f64,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Packet(MediaPacket),
    Eof,
}

/// Target window for a seek. The caller biases the window bounds by the
/// sign of the seek delta so short relative seeks land on the near side
/// of the target.
#[derive(Debug, Clone, Copy)]
pub struct SeekTarget {
    pub target_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub by_bytes: bool,
}

/// Properties of one selected elementary stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    /// Seconds per time-base tick.
    pub time_base: f64,
    /// Presentation start offset of the stream, in time-base ticks.
    pub start_time: Option<i64>,
    /// Average frame rate, when the container declares one.
    pub frame_rate: Option<f64>,
}

/// Owns the demux cursor. Exactly one reader thread drives this.
pub trait Demuxer: Send {
    fn read_packet(&mut self) -> Result<ReadOutcome, MediaError>;
    fn seek(&mut self, target: &SeekTarget) -> Result<(), MediaError>;
    /// Network-source pause/resume forwarding; no-ops for local files.
    fn pause(&mut self) {}
    fn resume(&mut self) {}
    fn duration_secs(&self) -> Option<f64>;
    fn start_time_secs(&self) -> Option<f64>;
    fn is_realtime(&self) -> bool;
    /// Largest plausible inter-frame gap; pts jumping further than this
    /// is a container discontinuity, not a long frame.
    fn max_frame_duration(&self) -> f64;
    fn prefers_byte_seek(&self) -> bool;
    fn streams(&self) -> &[StreamInfo];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// The codec refused the packet for now; retry after draining frames.
    Again,
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    Frame(DecodedFrame),
    NeedsInput,
    EndOfStream,
}

/// One codec instance bound to one stream.
pub trait StreamDecoder: Send {
    fn kind(&self) -> StreamKind;
    fn send(&mut self, packet: &MediaPacket) -> Result<SendOutcome, MediaError>;
    /// Signals end of stream to the codec so it drains buffered frames.
    fn send_drain(&mut self) -> Result<(), MediaError>;
    fn receive(&mut self) -> Result<ReceiveOutcome, MediaError>;
    /// Discards all codec-internal buffers (seek/flush discontinuity).
    fn flush(&mut self);
}
