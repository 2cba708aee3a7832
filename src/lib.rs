//! Rangefinder
//!
//! Per-frame object detection with monocular distance estimation.
//!
//! # Architecture
//!
//! Frames flow through a single sequential loop:
//!
//! 1. **Ingest**: a `FrameSource` yields frames from a file, a live device, or memory.
//! 2. **Detect**: a `DetectorBackend` returns labelled boxes with confidences.
//! 3. **Estimate**: `DistanceModel` turns box width into centimeters using the
//!    pinhole approximation `distance = known_width * focal_length / apparent_width`.
//! 4. **Annotate**: `FrameAnnotator` draws boxes, distance labels, and throughput.
//! 5. **Emit**: every configured `FrameSink` receives the annotated frame in capture order.
//!
//! The focal length is the only mutable shared state. It is owned by a
//! `FocalCalibrator` handle and frozen while the loop is running.
//!
//! # Module Structure
//!
//! - `distance`: known-width table and distance estimation
//! - `calibration`: focal length and one-shot calibration
//! - `frame`: owned RGB frames
//! - `detect`: detector capability, detections, backends
//! - `ingest`: frame sources
//! - `sink`: frame sinks
//! - `annotate`: box and label rendering
//! - `pipeline`: the loop state machine
//! - `config`: layered configuration

pub mod annotate;
pub mod calibration;
pub mod config;
pub mod detect;
pub mod distance;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod sink;

pub use annotate::{FrameAnnotator, LabelPlacement};
pub use calibration::{CalibrationFreeze, FocalCalibrator, FocalLength, DEFAULT_FOCAL_LENGTH};
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorBackend, StubBackend};
pub use distance::{DistanceModel, KnownWidthTable, DEFAULT_WIDTH_CM};
pub use frame::Frame;
pub use ingest::{FileSource, FrameSource, ScriptedSource, SourceInfo, SourceSpec};
pub use pipeline::{
    FramePolicy, Pipeline, PipelineSettings, PipelineState, RunReport, SinkFailurePolicy,
    StopSignal,
};
pub use sink::{FrameSink, ImageSequenceSink, MemorySink, OutputFormat};

// -------------------- Error Taxonomy --------------------

/// Errors the pipeline distinguishes by kind.
///
/// Per-detection and per-frame errors are contained by the loop according to
/// policy. Source and sink setup errors are fatal and surface to the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineError {
    /// The frame source could not be opened. The loop never starts.
    SourceUnavailable { source: String, reason: String },
    /// A detection box has no positive width.
    InvalidGeometry { apparent_width: f64 },
    /// A calibration argument was not a positive finite number.
    InvalidCalibration { reason: String },
    /// Calibration was attempted while the loop was running.
    CalibrationLocked,
    /// A sink rejected a frame.
    SinkWriteFailure { sink: String, reason: String },
    /// A frame could not be decoded or normalized.
    FrameDecodeFailure { reason: String },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            PipelineError::InvalidGeometry { .. } => "INVALID_GEOMETRY",
            PipelineError::InvalidCalibration { .. } => "INVALID_CALIBRATION",
            PipelineError::CalibrationLocked => "CALIBRATION_LOCKED",
            PipelineError::SinkWriteFailure { .. } => "SINK_WRITE_FAILURE",
            PipelineError::FrameDecodeFailure { .. } => "FRAME_DECODE_FAILURE",
        }
    }

    /// Returns the taxonomy entry carried by an `anyhow::Error`, if any.
    pub fn find(err: &anyhow::Error) -> Option<&PipelineError> {
        err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::SourceUnavailable { source, reason } => {
                write!(f, "{}: cannot open {}: {}", self.code(), source, reason)
            }
            PipelineError::InvalidGeometry { apparent_width } => write!(
                f,
                "{}: apparent width {} px is not positive",
                self.code(),
                apparent_width
            ),
            PipelineError::InvalidCalibration { reason } => {
                write!(f, "{}: {}", self.code(), reason)
            }
            PipelineError::CalibrationLocked => write!(
                f,
                "{}: focal length cannot change while the pipeline is running",
                self.code()
            ),
            PipelineError::SinkWriteFailure { sink, reason } => {
                write!(f, "{}: sink {}: {}", self.code(), sink, reason)
            }
            PipelineError::FrameDecodeFailure { reason } => {
                write!(f, "{}: {}", self.code(), reason)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_code() {
        let err = PipelineError::InvalidGeometry {
            apparent_width: 0.0,
        };
        assert!(err.to_string().starts_with("INVALID_GEOMETRY:"));
        assert_eq!(PipelineError::CalibrationLocked.code(), "CALIBRATION_LOCKED");
    }

    #[test]
    fn find_walks_context_chain() {
        let err = anyhow::Error::new(PipelineError::FrameDecodeFailure {
            reason: "truncated".to_string(),
        })
        .context("reading frame 7");
        assert_eq!(
            PipelineError::find(&err).map(|e| e.code()),
            Some("FRAME_DECODE_FAILURE")
        );

        let plain = anyhow::anyhow!("unrelated");
        assert!(PipelineError::find(&plain).is_none());
    }
}
