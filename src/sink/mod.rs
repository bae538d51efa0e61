//! Output endpoints: the cpal audio device and the video display seam.

pub mod audio;
pub mod video;

pub use audio::{AudioOutput, AudioSinkError};
pub use video::{NullVideoSink, VideoSink};
