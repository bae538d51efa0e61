//! Bounded queues connecting the pipeline threads.

pub mod frame;
pub mod packet;

pub use frame::{Frame, FrameQueue, AUDIO_FRAME_QUEUE_CAPACITY, VIDEO_FRAME_QUEUE_CAPACITY};
pub use packet::{Packet, PacketData, PacketQueue, MAX_PACKET_QUEUE_BYTES};
