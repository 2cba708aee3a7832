use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector capability: given a frame, return zero or more detections.
///
/// Boxes are in pixel coordinates of the frame passed in. Confidence
/// filtering is pipeline policy; backends may return low-confidence
/// detections.
///
/// The pipeline calls `detect` from one thread, one frame at a time, and
/// never concurrently. Backends need not be reentrant.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
