//! Display seam for the refresh loop.

use crate::queue::Frame;

/// Receives the frame the refresh loop decided to put up. Implementors
/// render however they like; the engine only decides *when*.
pub trait VideoSink {
    fn display(&mut self, frame: &Frame);
}

/// Headless sink: counts presentations and remembers the last pts.
#[derive(Debug, Default)]
pub struct NullVideoSink {
    pub frames_displayed: u64,
    pub last_pts: Option<f64>,
}

impl NullVideoSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoSink for NullVideoSink {
    fn display(&mut self, frame: &Frame) {
        self.frames_displayed += 1;
        if !frame.pts.is_nan() {
            self.last_pts = Some(frame.pts);
        }
    }
}
