//! The playback pipeline: reader and decoder threads, the pull-based
//! audio renderer, the video refresh loop and the player that wires
//! them together.

pub mod audio;
pub mod decoder;
pub mod player;
pub mod reader;
pub mod state;
pub mod video;
