//! Media playback engine with drift-compensated A/V synchronization.
//!
//! The pipeline is a set of OS threads connected through bounded queues:
//! a reader pulls compressed packets from the demuxer and routes them to
//! per-stream packet queues; one decoder thread per stream turns packets
//! into frames and pushes them into fixed-capacity frame rings; the audio
//! sink pulls samples through a non-blocking render callback; the video
//! refresh loop runs on the caller's thread and decides, every tick,
//! whether to show, hold or drop the next queued picture.
//!
//! Discontinuities (seek, flush) are tracked through monotonically
//! increasing serials stamped onto every packet and frame; any in-flight
//! data whose serial predates its queue's current serial is stale and gets
//! dropped wherever it is encountered.

pub mod clock;
pub mod media;
pub mod playback;
pub mod queue;
pub mod signal;
pub mod sink;

pub use clock::{Clock, SyncMode};
pub use playback::player::{Player, PlayerError};
pub use playback::state::PlayerSettings;
