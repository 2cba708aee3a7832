use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Scripted backend for testing and dry runs.
///
/// Returns the script entries in order, one per call, and repeats the last
/// entry once the script runs out. An empty script yields no detections.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    calls: usize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the same detections for every frame.
    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            script: vec![detections],
            calls: 0,
        }
    }

    /// Report `script[n]` for the n-th frame.
    pub fn with_script(script: Vec<Vec<Detection>>) -> Self {
        Self { script, calls: 0 }
    }

    /// Number of frames seen so far.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        let index = self.calls.min(self.script.len().saturating_sub(1));
        self.calls += 1;
        Ok(self.script.get(index).cloned().unwrap_or_default())
    }
}
