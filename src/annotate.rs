//! Box and label rendering.
//!
//! `FrameAnnotator` never touches the frame it is given. Each call clones the
//! pixels, draws on the clone, and returns it as a new `Frame`.
//!
//! Labels are rendered with a configured TrueType font or, when none is
//! configured, with the DejaVu Sans Mono face compiled into the binary.

use ab_glyph::{FontArc, FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

use crate::detect::{BoundingBox, Detection};
use crate::frame::Frame;

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const OVERLAY_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const BOX_THICKNESS: u32 = 2;
/// Gap between a label's baseline and the top edge of its box.
pub const LABEL_GAP: i32 = 10;
/// Baseline origin of the auxiliary overlay line.
pub const OVERLAY_ORIGIN: (i32, i32) = (10, 30);

const LABEL_SCALE: f32 = 18.0;
const OVERLAY_SCALE: f32 = 24.0;

static BUNDLED_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSansMono.ttf");

/// Top-left corner of a rendered text block, in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabelPlacement {
    pub x: i32,
    pub y: i32,
}

/// `"{category}: {distance:.2} cm"`
pub fn format_label(category: &str, distance_cm: f64) -> String {
    format!("{}: {:.2} cm", category, distance_cm)
}

/// Throughput line; `None` means the rate could not be measured.
pub fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => format!("FPS: {:.2}", rate),
        None => "FPS: N/A".to_string(),
    }
}

/// Place a `text_w`x`text_h` label so its baseline sits `LABEL_GAP` pixels
/// above the box's top-left corner, then clamp it inside the frame.
///
/// Boxes touching the top edge get their label pinned to row 0 instead of
/// rendering above the frame.
pub fn place_label(
    bbox: &BoundingBox,
    text_w: u32,
    text_h: u32,
    frame_w: u32,
    frame_h: u32,
) -> LabelPlacement {
    let x = bbox.x1.round() as i32;
    let y = bbox.y1.round() as i32 - LABEL_GAP - text_h as i32;
    LabelPlacement {
        x: clamp_axis(x, text_w, frame_w),
        y: clamp_axis(y, text_h, frame_h),
    }
}

fn clamp_axis(pos: i32, extent: u32, limit: u32) -> i32 {
    let max = limit.saturating_sub(extent).min(i32::MAX as u32) as i32;
    pos.clamp(0, max)
}

pub struct FrameAnnotator {
    font: FontArc,
    label_scale: PxScale,
    overlay_scale: PxScale,
}

impl FrameAnnotator {
    /// Annotator using the bundled font.
    pub fn new() -> Result<Self> {
        let font = FontArc::try_from_slice(BUNDLED_FONT).context("parsing bundled font")?;
        Ok(Self::with_font(font))
    }

    pub fn with_font(font: impl Into<FontArc>) -> Self {
        Self {
            font: font.into(),
            label_scale: PxScale::from(LABEL_SCALE),
            overlay_scale: PxScale::from(OVERLAY_SCALE),
        }
    }

    pub fn from_font_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("reading font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .with_context(|| format!("parsing font {}", path.display()))?;
        Ok(Self::with_font(font))
    }

    /// Use `font_path` if given, otherwise the bundled font.
    ///
    /// A configured font that cannot be read is an error rather than a silent
    /// fallback.
    pub fn load(font_path: Option<&Path>) -> Result<Self> {
        match font_path {
            Some(path) => {
                let annotator = Self::from_font_file(path)?;
                log::debug!("FrameAnnotator: using font {}", path.display());
                Ok(annotator)
            }
            None => Self::new(),
        }
    }

    /// Copy of `frame` with a box and a distance label per detection.
    pub fn annotate(&self, frame: &Frame, pairs: &[(Detection, f64)]) -> Frame {
        let mut image = frame.image().clone();
        for (detection, distance) in pairs {
            draw_box(&mut image, &detection.bbox);
            let text = format_label(&detection.label, *distance);
            let placement = self.label_placement(&text, &detection.bbox, frame);
            self.draw_text(&mut image, BOX_COLOR, placement, self.label_scale, &text);
        }
        frame.with_image(image)
    }

    /// Copy of `frame` with one line of text at `OVERLAY_ORIGIN`.
    pub fn overlay(&self, frame: &Frame, text: &str) -> Frame {
        let mut image = frame.image().clone();
        let (text_w, text_h) = self.text_extent(self.overlay_scale, text);
        let placement = LabelPlacement {
            x: clamp_axis(OVERLAY_ORIGIN.0, text_w, frame.width()),
            y: clamp_axis(OVERLAY_ORIGIN.1 - text_h as i32, text_h, frame.height()),
        };
        self.draw_text(&mut image, OVERLAY_COLOR, placement, self.overlay_scale, text);
        frame.with_image(image)
    }

    /// Where the label for `bbox` would be drawn on `frame`.
    pub fn label_placement(&self, text: &str, bbox: &BoundingBox, frame: &Frame) -> LabelPlacement {
        let (text_w, text_h) = self.text_extent(self.label_scale, text);
        place_label(bbox, text_w, text_h, frame.width(), frame.height())
    }

    fn text_extent(&self, scale: PxScale, text: &str) -> (u32, u32) {
        text_size(scale, &self.font, text)
    }

    fn draw_text(
        &self,
        image: &mut RgbImage,
        color: Rgb<u8>,
        at: LabelPlacement,
        scale: PxScale,
        text: &str,
    ) {
        draw_text_mut(image, color, at.x, at.y, scale, &self.font, text);
    }
}

impl std::fmt::Debug for FrameAnnotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAnnotator")
            .field("overlay_scale", &self.overlay_scale.y)
            .field("label_scale", &self.label_scale.y)
            .finish()
    }
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox) {
    let clamped = bbox.clamped(image.width(), image.height());
    let x = clamped.x1.round() as i32;
    let y = clamped.y1.round() as i32;
    let w = clamped.width().round() as u32;
    let h = clamped.height().round() as u32;
    for inset in 0..BOX_THICKNESS {
        let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
        if iw == 0 || ih == 0 {
            break;
        }
        let rect = Rect::at(x + inset as i32, y + inset as i32).of_size(iw, ih);
        draw_hollow_rect_mut(image, rect, BOX_COLOR);
    }
}
