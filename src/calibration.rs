//! Focal length state and one-shot calibration.
//!
//! The focal length (in pixel-equivalent units) is the single piece of mutable
//! state shared between calibration and distance estimation. It lives behind a
//! `FocalCalibrator` handle; clones share the same value.
//!
//! While the pipeline is running it holds a `CalibrationFreeze` guard and any
//! calibration attempt fails with `CalibrationLocked`. Freezes nest: the value
//! stays locked until every outstanding guard is dropped. Calibration is
//! expected to happen before the loop starts.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::PipelineError;

/// Focal length used when no calibration has been performed.
pub const DEFAULT_FOCAL_LENGTH: f64 = 1000.0;

/// A validated focal length. Always finite and strictly positive.
///
/// The inner value is private, so a focal length can only be obtained through
/// validation:
///
/// ```compile_fail
/// let _f = rangefinder::FocalLength(0.0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct FocalLength(f64);

impl FocalLength {
    pub fn new(value: f64) -> Result<Self, PipelineError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(PipelineError::InvalidCalibration {
                reason: format!("focal length must be positive and finite, got {}", value),
            });
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for FocalLength {
    fn default() -> Self {
        Self(DEFAULT_FOCAL_LENGTH)
    }
}

impl std::fmt::Display for FocalLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// Derive a focal length from an object of known width seen at a known distance.
///
/// `focal_length = apparent_width_px * known_distance / known_width`
pub fn derive_focal_length(
    known_distance: f64,
    known_width: f64,
    apparent_width_px: f64,
) -> Result<FocalLength, PipelineError> {
    for (name, value) in [
        ("known distance", known_distance),
        ("known width", known_width),
        ("apparent width", apparent_width_px),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(PipelineError::InvalidCalibration {
                reason: format!("{} must be positive and finite, got {}", name, value),
            });
        }
    }
    FocalLength::new((apparent_width_px * known_distance) / known_width)
}

struct FocalState {
    focal_length: FocalLength,
    freezes: usize,
}

/// Shared handle to the process focal length.
#[derive(Clone)]
pub struct FocalCalibrator {
    state: Arc<Mutex<FocalState>>,
}

impl FocalCalibrator {
    pub fn new() -> Self {
        Self::with_focal_length(FocalLength::default())
    }

    pub fn with_focal_length(focal_length: FocalLength) -> Self {
        Self {
            state: Arc::new(Mutex::new(FocalState {
                focal_length,
                freezes: 0,
            })),
        }
    }

    /// Current focal length.
    pub fn focal_length(&self) -> FocalLength {
        lock(&self.state).focal_length
    }

    /// Calibrate from a reference measurement and store the result.
    ///
    /// On any error the previous focal length is left unchanged.
    pub fn calibrate(
        &self,
        known_distance: f64,
        known_width: f64,
        apparent_width_px: f64,
    ) -> Result<FocalLength, PipelineError> {
        let focal_length = derive_focal_length(known_distance, known_width, apparent_width_px)?;
        self.set(focal_length)?;
        log::info!("focal length calibrated to {}", focal_length);
        Ok(focal_length)
    }

    /// Replace the focal length with an already validated value.
    pub fn set(&self, focal_length: FocalLength) -> Result<(), PipelineError> {
        let mut state = lock(&self.state);
        if state.freezes > 0 {
            return Err(PipelineError::CalibrationLocked);
        }
        state.focal_length = focal_length;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        lock(&self.state).freezes > 0
    }

    /// Freeze the focal length until the returned guard is dropped.
    pub fn freeze(&self) -> CalibrationFreeze {
        lock(&self.state).freezes += 1;
        CalibrationFreeze {
            state: Arc::clone(&self.state),
        }
    }
}

// The state is plain data and every critical section is a single field
// update, so a poisoned lock still holds a consistent value.
fn lock(state: &Mutex<FocalState>) -> MutexGuard<'_, FocalState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for FocalCalibrator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FocalCalibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FocalCalibrator")
            .field("focal_length", &self.focal_length())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// Keeps the focal length frozen while alive.
pub struct CalibrationFreeze {
    state: Arc<Mutex<FocalState>>,
}

impl Drop for CalibrationFreeze {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.freezes = state.freezes.saturating_sub(1);
    }
}
