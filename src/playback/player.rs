//! Player: owns the session, the worker threads and the sinks.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::media::ffmpeg::FfmpegDemuxer;
use crate::media::{Demuxer, MediaError, StreamKind};
use crate::playback::audio::AudioRenderer;
use crate::playback::decoder::run_decoder;
use crate::playback::reader::run_reader;
use crate::playback::state::{
    effective_sync_mode, PlayerSettings, SeekRequest, Session, StreamPipe,
};
use crate::playback::video::VideoLoop;
use crate::queue::{AUDIO_FRAME_QUEUE_CAPACITY, VIDEO_FRAME_QUEUE_CAPACITY};
use crate::signal::Notifier;
use crate::sink::{AudioOutput, AudioSinkError, VideoSink};

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Audio(#[from] AudioSinkError),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Early and late frame drops since open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameDropStats {
    pub early: u64,
    pub late: u64,
}

/// A playing media session. Construct with [`Player::open`], then drive
/// [`Player::refresh`] from the presentation thread.
pub struct Player {
    session: Arc<Session>,
    reader: Option<JoinHandle<()>>,
    decoders: Vec<JoinHandle<()>>,
    audio_output: Option<AudioOutput>,
    video_loop: Option<VideoLoop>,
}

impl Player {
    pub fn open(path: &str, settings: PlayerSettings) -> Result<Self, PlayerError> {
        let demuxer = FfmpegDemuxer::open(path)?;
        let streams = demuxer.streams().to_vec();
        let video_info = streams.iter().find(|s| s.kind == StreamKind::Video).cloned();
        let audio_info = streams.iter().find(|s| s.kind == StreamKind::Audio).cloned();

        // An unusable audio device downgrades to video-only playback.
        let audio_builder = if audio_info.is_some() {
            match crate::sink::audio::AudioOutputBuilder::new() {
                Ok(builder) => Some(builder),
                Err(e) => {
                    warn!("audio disabled: {e}");
                    None
                }
            }
        } else {
            None
        };
        let audio_info = audio_info.filter(|_| audio_builder.is_some());

        let reader_wake = Arc::new(Notifier::new());
        let video_pipe = video_info.as_ref().map(|info| {
            Arc::new(StreamPipe::new(
                info.index,
                VIDEO_FRAME_QUEUE_CAPACITY,
                true,
                info.time_base,
                Arc::clone(&reader_wake),
            ))
        });
        let audio_pipe = audio_info.as_ref().map(|info| {
            Arc::new(StreamPipe::new(
                info.index,
                AUDIO_FRAME_QUEUE_CAPACITY,
                true,
                info.time_base,
                Arc::clone(&reader_wake),
            ))
        });

        let audio_clock = match &audio_pipe {
            Some(pipe) => Clock::new(pipe.packets.serial_handle()),
            None => Clock::new(Arc::new(AtomicI32::new(-1))),
        };
        let video_clock = match &video_pipe {
            Some(pipe) => Clock::new(pipe.packets.serial_handle()),
            None => Clock::new(Arc::new(AtomicI32::new(-1))),
        };

        let sync_mode = effective_sync_mode(
            settings.sync_mode,
            audio_pipe.is_some(),
            video_pipe.is_some(),
        );
        info!(
            ?sync_mode,
            video = video_pipe.is_some(),
            audio = audio_pipe.is_some(),
            "opened {path}"
        );

        let loops = settings.loop_count;
        let start_time = settings.start_time;
        let session = Arc::new(Session {
            settings,
            sync_mode,
            audio: audio_pipe.clone(),
            video: video_pipe.clone(),
            audio_clock,
            video_clock,
            external_clock: Clock::free_running(),
            reader_wake,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            step: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            seek: Mutex::new(None),
            loops_remaining: AtomicI32::new(loops),
            frame_timer: AtomicCell::new(0.0),
            early_drops: AtomicU64::new(0),
            late_drops: AtomicU64::new(0),
            realtime: demuxer.is_realtime(),
            max_frame_duration: demuxer.max_frame_duration(),
            media_start_time: demuxer.start_time_secs(),
            media_duration: demuxer.duration_secs(),
            master_frame_rate: video_info.as_ref().and_then(|info| info.frame_rate),
        });

        let mut decoders = Vec::new();
        if let (Some(pipe), Some(info)) = (&video_pipe, &video_info) {
            let decoder = demuxer
                .open_video_decoder(info.index, session.settings.use_best_effort_pts)?;
            pipe.packets.start();
            let session = Arc::clone(&session);
            let pipe = Arc::clone(pipe);
            decoders.push(
                std::thread::Builder::new()
                    .name("video-decode".into())
                    .spawn(move || run_decoder(session, pipe, Box::new(decoder)))?,
            );
        }

        let mut audio_output = None;
        if let (Some(pipe), Some(info), Some(builder)) = (&audio_pipe, &audio_info, audio_builder)
        {
            let decoder =
                demuxer.open_audio_decoder(info.index, builder.rate(), builder.channels())?;
            pipe.packets.start();
            {
                let session = Arc::clone(&session);
                let pipe = Arc::clone(pipe);
                decoders.push(
                    std::thread::Builder::new()
                        .name("audio-decode".into())
                        .spawn(move || run_decoder(session, pipe, Box::new(decoder)))?,
                );
            }
            let renderer = AudioRenderer::new(
                Arc::clone(&session),
                Arc::clone(pipe),
                builder.rate(),
                builder.channels(),
                builder.latency(),
            );
            audio_output = Some(builder.start(renderer)?);
        }

        let reader = {
            let session = Arc::clone(&session);
            std::thread::Builder::new()
                .name("reader".into())
                .spawn(move || run_reader(session, Box::new(demuxer)))?
        };

        if let Some(start) = start_time {
            session.request_seek(SeekRequest {
                target: start,
                delta: 0.0,
                by_bytes: false,
            });
        }

        let video_loop = video_pipe
            .as_ref()
            .map(|pipe| VideoLoop::new(Arc::clone(&session), Arc::clone(pipe)));

        Ok(Self {
            session,
            reader: Some(reader),
            decoders,
            audio_output,
            video_loop,
        })
    }

    /// One presentation tick; see [`VideoLoop::refresh`]. Call it in a
    /// loop, sleeping at most `remaining` seconds in between.
    pub fn refresh(&mut self, sink: &mut dyn VideoSink, remaining: &mut f64) {
        if let Some(video_loop) = &self.video_loop {
            video_loop.refresh(sink, remaining);
        }
    }

    pub fn toggle_pause(&self) {
        self.session.toggle_pause();
        self.session.step.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.session.is_paused()
    }

    /// Resume for exactly one video frame, then pause again.
    pub fn step_to_next_frame(&self) {
        self.session.step_to_next_frame();
    }

    /// Seeks `delta` seconds away from the current master position.
    pub fn seek_relative(&self, delta: f64) {
        let position = self.session.master_clock();
        if !position.is_finite() {
            return;
        }
        self.session.request_seek(SeekRequest {
            target: position + delta,
            delta,
            by_bytes: false,
        });
    }

    /// Seeks to an absolute position in seconds.
    pub fn seek_to(&self, target: f64) {
        self.session.request_seek(SeekRequest {
            target,
            delta: 0.0,
            by_bytes: false,
        });
    }

    /// True until playback finishes (with auto-exit) or close is called.
    pub fn is_running(&self) -> bool {
        !self.session.is_stopped()
    }

    /// Master-clock position and estimated frame number.
    pub fn progress(&self) -> (f64, Option<u64>) {
        self.session.progress()
    }

    pub fn duration(&self) -> Option<f64> {
        self.session.media_duration
    }

    pub fn stats(&self) -> FrameDropStats {
        FrameDropStats {
            early: self.session.early_drops.load(Ordering::Relaxed),
            late: self.session.late_drops.load(Ordering::Relaxed),
        }
    }

    /// Stops every thread and releases the sinks. Idempotent.
    pub fn close(&mut self) {
        self.session.stop();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        for decoder in self.decoders.drain(..) {
            let _ = decoder.join();
        }
        self.audio_output = None;
        self.video_loop = None;
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::SyncMode;

    /// External-master session around one video pipe.
    pub fn session_with_video(pipe: Arc<StreamPipe>) -> Session {
        let video_clock = Clock::new(pipe.packets.serial_handle());
        Session {
            settings: PlayerSettings::default(),
            sync_mode: SyncMode::External,
            audio: None,
            video: Some(pipe),
            audio_clock: Clock::new(Arc::new(AtomicI32::new(-1))),
            video_clock,
            external_clock: Clock::free_running(),
            reader_wake: Arc::new(Notifier::new()),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            step: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            seek: Mutex::new(None),
            loops_remaining: AtomicI32::new(0),
            frame_timer: AtomicCell::new(0.0),
            early_drops: AtomicU64::new(0),
            late_drops: AtomicU64::new(0),
            realtime: false,
            max_frame_duration: 10.0,
            media_start_time: None,
            media_duration: None,
            master_frame_rate: None,
        }
    }

    /// Audio-master session with the audio clock slaved elsewhere.
    pub fn external_session_with_audio(pipe: Arc<StreamPipe>) -> Session {
        let mut session = session_with_audio(pipe);
        session.sync_mode = SyncMode::External;
        session
    }

    /// Minimal audio-master session around one audio pipe.
    pub fn session_with_audio(pipe: Arc<StreamPipe>) -> Session {
        let audio_clock = Clock::new(pipe.packets.serial_handle());
        Session {
            settings: PlayerSettings::default(),
            sync_mode: SyncMode::AudioMaster,
            audio: Some(pipe),
            video: None,
            audio_clock,
            video_clock: Clock::new(Arc::new(AtomicI32::new(-1))),
            external_clock: Clock::free_running(),
            reader_wake: Arc::new(Notifier::new()),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            step: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            seek: Mutex::new(None),
            loops_remaining: AtomicI32::new(0),
            frame_timer: AtomicCell::new(0.0),
            early_drops: AtomicU64::new(0),
            late_drops: AtomicU64::new(0),
            realtime: false,
            max_frame_duration: 10.0,
            media_start_time: None,
            media_duration: None,
            master_frame_rate: None,
        }
    }
}
