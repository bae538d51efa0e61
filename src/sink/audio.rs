//! cpal output device wiring.
//!
//! The device's callback pulls samples through an [`AudioRenderer`];
//! nothing here pushes. The stream is built in two steps so the decoder
//! can be configured with the device format before any audio flows.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tracing::{error, info};

use crate::playback::audio::AudioRenderer;

#[derive(Debug, Error)]
pub enum AudioSinkError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("unsupported stream config: {0}")]
    Config(#[from] cpal::DefaultStreamConfigError),
    #[error("failed to build stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("failed to start stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
}

/// Fallback period estimate when the device does not report one.
const DEFAULT_PERIOD_FRAMES: u32 = 1024;

/// Default output device plus its negotiated format, before the stream
/// exists.
pub struct AudioOutputBuilder {
    device: cpal::Device,
    config: cpal::StreamConfig,
    latency: f64,
}

impl AudioOutputBuilder {
    pub fn new() -> Result<Self, AudioSinkError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioSinkError::NoDevice)?;
        let supported = device.default_output_config()?;
        let period = match supported.buffer_size() {
            cpal::SupportedBufferSize::Range { min, .. } => (*min).max(256),
            cpal::SupportedBufferSize::Unknown => DEFAULT_PERIOD_FRAMES,
        };
        let config: cpal::StreamConfig = supported.into();
        // Two periods in flight between us and the hardware.
        let latency = f64::from(2 * period) / f64::from(config.sample_rate.0);
        info!(
            rate = config.sample_rate.0,
            channels = config.channels,
            latency,
            "audio output configured"
        );
        Ok(Self {
            device,
            config,
            latency,
        })
    }

    pub fn rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Estimated seconds between a sample entering the callback and
    /// reaching the speaker.
    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// Builds and starts the output stream around `renderer`.
    pub fn start(self, mut renderer: AudioRenderer) -> Result<AudioOutput, AudioSinkError> {
        let stream = self.device.build_output_stream(
            &self.config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                renderer.render(data);
            },
            |err| error!("audio stream error: {err}"),
            None,
        )?;
        stream.play()?;
        Ok(AudioOutput { _stream: stream })
    }
}

/// Keeps the device callback alive; dropping it stops audio.
pub struct AudioOutput {
    _stream: cpal::Stream,
}
