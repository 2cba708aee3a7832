//! Owned RGB frames.
//!
//! A `Frame` moves from source to pipeline to annotator to sinks. The pipeline
//! never mutates a frame it was handed; resizing and annotation produce new
//! frames, so a caller holding the raw frame keeps an untouched copy.

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::Instant;

use crate::PipelineError;

/// A decoded RGB24 frame with its capture sequence number.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Position in capture order, starting at 1 for the first frame of a source.
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(sequence: u64, image: RgbImage) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Wrap packed RGB24 bytes, validating the buffer length.
    pub fn from_rgb(sequence: u64, pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| PipelineError::FrameDecodeFailure {
                reason: format!("frame dimensions {}x{} overflow", width, height),
            })?;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(PipelineError::FrameDecodeFailure {
                reason: format!(
                    "expected {} RGB bytes for {}x{}, received {}",
                    expected,
                    width,
                    height,
                    pixels.len()
                ),
            }
            .into());
        }
        let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
            PipelineError::FrameDecodeFailure {
                reason: "RGB buffer rejected".to_string(),
            }
        })?;
        Ok(Self::new(sequence, image))
    }

    /// Solid-colour frame, mostly useful for tests and synthetic sources.
    pub fn filled(sequence: u64, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(sequence, RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB24 bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Time since the frame was captured.
    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }

    /// Copy of this frame at `width`x`height`. Returns a plain copy if the
    /// size already matches.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if self.width() == width && self.height() == height {
            return self.clone();
        }
        let image = imageops::resize(&self.image, width, height, FilterType::Triangle);
        Self {
            image,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }

    /// Copy of this frame with its pixels replaced. Sequence and capture time carry over.
    pub(crate) fn with_image(&self, image: RgbImage) -> Frame {
        Self {
            image,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }
}
