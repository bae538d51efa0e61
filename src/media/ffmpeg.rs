//! ffmpeg-next implementations of [`Demuxer`] and [`StreamDecoder`].
//!
//! Video frames are converted to RGBA8 through swscale; audio frames are
//! resampled to interleaved f32 at the sink's rate through swresample, so
//! everything downstream of this module is format-agnostic.

use ffmpeg_next as ffmpeg;

use ffmpeg::format::{sample, Pixel, Sample};
use ffmpeg::software::{resampling, scaling};
use ffmpeg::ChannelLayout;

use super::{
    AudioSamples, DecodedFrame, DecodedPayload, Demuxer, MediaError, MediaPacket, ReadOutcome,
    ReceiveOutcome, SeekTarget, SendOutcome, StreamDecoder, StreamInfo, StreamKind, VideoPixels,
};

/// Registers ffmpeg once per process. Safe to call repeatedly.
pub fn init() -> Result<(), MediaError> {
    ffmpeg::init().map_err(|e| MediaError::Open(e.to_string()))
}

fn rational_to_f64(r: ffmpeg::Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        f64::from(r.numerator()) / f64::from(r.denominator())
    }
}

/// Demuxer over an `AVFormatContext`.
pub struct FfmpegDemuxer {
    input: ffmpeg::format::context::Input,
    url: String,
    streams: Vec<StreamInfo>,
    realtime: bool,
    max_frame_duration: f64,
    prefers_byte_seek: bool,
}

impl FfmpegDemuxer {
    pub fn open(url: &str) -> Result<Self, MediaError> {
        init()?;
        let input =
            ffmpeg::format::input(&url.to_owned()).map_err(|e| MediaError::Open(e.to_string()))?;

        let format_name = input.format().name().to_owned();
        let realtime = matches!(format_name.as_str(), "rtp" | "rtsp" | "sdp")
            || url.starts_with("rtp:")
            || url.starts_with("udp:");

        // AVFMT_TS_DISCONT is not surfaced by the safe wrapper.
        let ts_discont = unsafe {
            let fmt = (*input.as_ptr()).iformat;
            !fmt.is_null() && ((*fmt).flags & ffmpeg::ffi::AVFMT_TS_DISCONT) != 0
        };
        let max_frame_duration = if ts_discont { 10.0 } else { 3600.0 };
        let prefers_byte_seek = ts_discont && format_name != "ogg";

        let mut streams = Vec::new();
        for kind in [StreamKind::Video, StreamKind::Audio] {
            let media_type = match kind {
                StreamKind::Video => ffmpeg::media::Type::Video,
                StreamKind::Audio => ffmpeg::media::Type::Audio,
            };
            if let Some(stream) = input.streams().best(media_type) {
                let start_time = match stream.start_time() {
                    ffmpeg::ffi::AV_NOPTS_VALUE => None,
                    ts => Some(ts),
                };
                let frame_rate = Some(rational_to_f64(stream.avg_frame_rate()))
                    .filter(|rate| *rate > 0.0 && rate.is_finite());
                streams.push(StreamInfo {
                    index: stream.index(),
                    kind,
                    time_base: rational_to_f64(stream.time_base()),
                    start_time,
                    frame_rate,
                });
            }
        }
        if streams.is_empty() {
            return Err(MediaError::NoStreams);
        }

        Ok(Self {
            input,
            url: url.to_owned(),
            streams,
            realtime,
            max_frame_duration,
            prefers_byte_seek,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn stream_by_index(&self, index: usize) -> Result<ffmpeg::Stream<'_>, MediaError> {
        self.input
            .streams()
            .find(|s| s.index() == index)
            .ok_or_else(|| MediaError::Open(format!("no stream with index {index}")))
    }

    /// Opens a video codec for `stream_index`. With `use_best_effort`
    /// the decoder trusts ffmpeg's reconstructed timestamps, otherwise it
    /// falls back to raw pts.
    pub fn open_video_decoder(
        &self,
        stream_index: usize,
        use_best_effort: bool,
    ) -> Result<FfmpegVideoDecoder, MediaError> {
        let stream = self.stream_by_index(stream_index)?;
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| MediaError::CodecOpen(e.to_string()))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| MediaError::CodecOpen(e.to_string()))?;
        let frame_rate = Some(rational_to_f64(stream.avg_frame_rate()))
            .filter(|rate| *rate > 0.0 && rate.is_finite());
        Ok(FfmpegVideoDecoder {
            decoder,
            scaler: None,
            time_base: rational_to_f64(stream.time_base()),
            declared_duration: frame_rate.map(|r| 1.0 / r).unwrap_or(0.0),
            use_best_effort,
        })
    }

    /// Opens an audio codec for `stream_index`, resampling to interleaved
    /// f32 at `out_rate`/`out_channels` (the sink's format).
    pub fn open_audio_decoder(
        &self,
        stream_index: usize,
        out_rate: u32,
        out_channels: u16,
    ) -> Result<FfmpegAudioDecoder, MediaError> {
        let stream = self.stream_by_index(stream_index)?;
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| MediaError::CodecOpen(e.to_string()))?;
        let decoder = context
            .decoder()
            .audio()
            .map_err(|e| MediaError::CodecOpen(e.to_string()))?;
        Ok(FfmpegAudioDecoder {
            decoder,
            resampler: None,
            time_base: rational_to_f64(stream.time_base()),
            out_rate,
            out_channels,
        })
    }
}

// SAFETY: the AVFormatContext is not safe for concurrent access, but it
// can be moved between threads. The demuxer is built on the opening
// thread and handed to the reader thread, which owns it exclusively
// from then on.
unsafe impl Send for FfmpegDemuxer {}

impl Demuxer for FfmpegDemuxer {
    fn read_packet(&mut self) -> Result<ReadOutcome, MediaError> {
        match self.input.packets().next() {
            Some((stream, packet)) => {
                let data = packet.data().map(<[u8]>::to_vec).unwrap_or_default();
                Ok(ReadOutcome::Packet(MediaPacket {
                    stream_index: stream.index(),
                    data,
                    pts: packet.pts(),
                    dts: packet.dts(),
                    duration: packet.duration(),
                    is_key: packet.is_key(),
                }))
            }
            None => Ok(ReadOutcome::Eof),
        }
    }

    fn seek(&mut self, target: &SeekTarget) -> Result<(), MediaError> {
        if target.by_bytes {
            // Byte positions go through avformat_seek_file directly; the
            // safe wrapper has no BYTE flag.
            let ret = unsafe {
                ffmpeg::ffi::avformat_seek_file(
                    self.input.as_mut_ptr(),
                    -1,
                    target.min_secs as i64,
                    target.target_secs as i64,
                    target.max_secs as i64,
                    ffmpeg::ffi::AVSEEK_FLAG_BYTE,
                )
            };
            if ret < 0 {
                return Err(MediaError::Seek(format!(
                    "byte seek to {} failed ({ret})",
                    target.target_secs as i64
                )));
            }
            return Ok(());
        }
        let scale = f64::from(ffmpeg::ffi::AV_TIME_BASE);
        let ts = (target.target_secs * scale) as i64;
        let min = (target.min_secs * scale) as i64;
        let max = (target.max_secs * scale) as i64;
        self.input
            .seek(ts, min..max)
            .map_err(|e| MediaError::Seek(e.to_string()))
    }

    fn pause(&mut self) {
        let _ = self.input.pause();
    }

    fn resume(&mut self) {
        let _ = self.input.play();
    }

    fn duration_secs(&self) -> Option<f64> {
        match self.input.duration() {
            ffmpeg::ffi::AV_NOPTS_VALUE => None,
            d => Some(d as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)),
        }
    }

    fn start_time_secs(&self) -> Option<f64> {
        let start = unsafe { (*self.input.as_ptr()).start_time };
        match start {
            ffmpeg::ffi::AV_NOPTS_VALUE => None,
            s => Some(s as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)),
        }
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    fn max_frame_duration(&self) -> f64 {
        self.max_frame_duration
    }

    fn prefers_byte_seek(&self) -> bool {
        self.prefers_byte_seek
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }
}

fn rebuild_packet(packet: &MediaPacket) -> ffmpeg::Packet {
    let mut pkt = ffmpeg::Packet::copy(&packet.data);
    pkt.set_pts(packet.pts);
    pkt.set_dts(packet.dts);
    pkt.set_duration(packet.duration);
    if packet.is_key {
        pkt.set_flags(ffmpeg::packet::Flags::KEY);
    }
    pkt
}

fn map_send(result: Result<(), ffmpeg::Error>) -> Result<SendOutcome, MediaError> {
    match result {
        Ok(()) => Ok(SendOutcome::Accepted),
        Err(ffmpeg::Error::Other {
            errno: ffmpeg::util::error::EAGAIN,
        }) => Ok(SendOutcome::Again),
        // After EOF the codec takes no more input; drop the packet.
        Err(ffmpeg::Error::Eof) => Ok(SendOutcome::Accepted),
        Err(e) => Err(MediaError::Decode(e.to_string())),
    }
}

/// Video codec + RGBA converter.
///
/// Built on the opening thread, then moved to its decode thread which
/// accesses it exclusively; same single-ownership argument as
/// [`FfmpegDemuxer`].
pub struct FfmpegVideoDecoder {
    decoder: ffmpeg::decoder::Video,
    scaler: Option<scaling::Context>,
    time_base: f64,
    declared_duration: f64,
    use_best_effort: bool,
}

// SAFETY: moved to the video decode thread after construction; never
// shared.
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    fn ensure_scaler(&mut self, frame: &ffmpeg::frame::Video) -> Result<(), MediaError> {
        let needs_rebuild = match &self.scaler {
            None => true,
            Some(scaler) => {
                let input = scaler.input();
                input.format != frame.format()
                    || input.width != frame.width()
                    || input.height != frame.height()
            }
        };
        if needs_rebuild {
            self.scaler = Some(
                scaling::Context::get(
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    Pixel::RGBA,
                    frame.width(),
                    frame.height(),
                    scaling::Flags::BILINEAR,
                )
                .map_err(|e| MediaError::Decode(e.to_string()))?,
            );
        }
        Ok(())
    }

    fn convert(&mut self, frame: &ffmpeg::frame::Video) -> Result<VideoPixels, MediaError> {
        self.ensure_scaler(frame)?;
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| MediaError::Decode("scaler unavailable".into()))?;
        let mut rgba = ffmpeg::frame::Video::empty();
        scaler
            .run(frame, &mut rgba)
            .map_err(|e| MediaError::Decode(e.to_string()))?;

        let width = rgba.width() as usize;
        let height = rgba.height() as usize;
        let stride = rgba.stride(0);
        let src = rgba.data(0);
        let row_bytes = width * 4;
        let mut data = Vec::with_capacity(row_bytes * height);
        for row in 0..height {
            let offset = row * stride;
            data.extend_from_slice(&src[offset..offset + row_bytes]);
        }
        Ok(VideoPixels {
            width: rgba.width(),
            height: rgba.height(),
            data,
        })
    }
}

impl StreamDecoder for FfmpegVideoDecoder {
    fn kind(&self) -> StreamKind {
        StreamKind::Video
    }

    fn send(&mut self, packet: &MediaPacket) -> Result<SendOutcome, MediaError> {
        let pkt = rebuild_packet(packet);
        map_send(self.decoder.send_packet(&pkt))
    }

    fn send_drain(&mut self) -> Result<(), MediaError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(MediaError::Decode(e.to_string())),
        }
    }

    fn receive(&mut self) -> Result<ReceiveOutcome, MediaError> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let ts = if self.use_best_effort {
                    frame.timestamp()
                } else {
                    frame.pts()
                };
                let pixels = self.convert(&frame)?;
                Ok(ReceiveOutcome::Frame(DecodedFrame {
                    payload: DecodedPayload::Video(pixels),
                    pts: ts.map(|t| t as f64 * self.time_base),
                    duration: self.declared_duration,
                }))
            }
            Err(ffmpeg::Error::Other {
                errno: ffmpeg::util::error::EAGAIN,
            }) => Ok(ReceiveOutcome::NeedsInput),
            Err(ffmpeg::Error::Eof) => Ok(ReceiveOutcome::EndOfStream),
            Err(e) => Err(MediaError::Decode(e.to_string())),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// Audio codec + f32 resampler.
pub struct FfmpegAudioDecoder {
    decoder: ffmpeg::decoder::Audio,
    resampler: Option<resampling::Context>,
    time_base: f64,
    out_rate: u32,
    out_channels: u16,
}

// SAFETY: moved to the audio decode thread after construction; never
// shared.
unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    fn out_layout(&self) -> ChannelLayout {
        match self.out_channels {
            1 => ChannelLayout::MONO,
            2 => ChannelLayout::STEREO,
            n => ChannelLayout::default(i32::from(n)),
        }
    }

    fn ensure_resampler(&mut self, frame: &ffmpeg::frame::Audio) -> Result<(), MediaError> {
        let src_layout = if frame.channel_layout().is_empty() {
            ChannelLayout::default(frame.channels().into())
        } else {
            frame.channel_layout()
        };
        let needs_rebuild = match &self.resampler {
            None => true,
            Some(resampler) => {
                let input = resampler.input();
                input.format != frame.format()
                    || input.rate != frame.rate()
                    || input.channel_layout != src_layout
            }
        };
        if needs_rebuild {
            self.resampler = Some(
                resampling::Context::get(
                    frame.format(),
                    src_layout,
                    frame.rate(),
                    Sample::F32(sample::Type::Packed),
                    self.out_layout(),
                    self.out_rate,
                )
                .map_err(|e| MediaError::Decode(e.to_string()))?,
            );
        }
        Ok(())
    }

    fn resample(&mut self, frame: &ffmpeg::frame::Audio) -> Result<AudioSamples, MediaError> {
        self.ensure_resampler(frame)?;
        let resampler = self
            .resampler
            .as_mut()
            .ok_or_else(|| MediaError::Decode("resampler unavailable".into()))?;
        let mut out = ffmpeg::frame::Audio::empty();
        resampler
            .run(frame, &mut out)
            .map_err(|e| MediaError::Decode(e.to_string()))?;

        let channels = usize::from(self.out_channels);
        let wanted = out.samples() * channels;
        let raw = out.data(0);
        let mut samples = Vec::with_capacity(wanted);
        for chunk in raw.chunks_exact(4).take(wanted) {
            samples.push(f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(AudioSamples {
            rate: self.out_rate,
            channels: self.out_channels,
            samples,
        })
    }
}

impl StreamDecoder for FfmpegAudioDecoder {
    fn kind(&self) -> StreamKind {
        StreamKind::Audio
    }

    fn send(&mut self, packet: &MediaPacket) -> Result<SendOutcome, MediaError> {
        let pkt = rebuild_packet(packet);
        map_send(self.decoder.send_packet(&pkt))
    }

    fn send_drain(&mut self) -> Result<(), MediaError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(MediaError::Decode(e.to_string())),
        }
    }

    fn receive(&mut self) -> Result<ReceiveOutcome, MediaError> {
        let mut frame = ffmpeg::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let pts = frame.pts().map(|t| t as f64 * self.time_base);
                let audio = self.resample(&frame)?;
                let duration = if audio.rate == 0 {
                    0.0
                } else {
                    audio.frames() as f64 / f64::from(audio.rate)
                };
                Ok(ReceiveOutcome::Frame(DecodedFrame {
                    payload: DecodedPayload::Audio(audio),
                    pts,
                    duration,
                }))
            }
            Err(ffmpeg::Error::Other {
                errno: ffmpeg::util::error::EAGAIN,
            }) => Ok(ReceiveOutcome::NeedsInput),
            Err(ffmpeg::Error::Eof) => Ok(ReceiveOutcome::EndOfStream),
            Err(e) => Err(MediaError::Decode(e.to_string())),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}
