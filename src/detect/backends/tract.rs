#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::label_for;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Floor below which candidate boxes are discarded before NMS.
///
/// Kept well under the pipeline threshold so filtering stays pipeline policy.
const DEFAULT_CANDIDATE_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const BOX_OFFSET: usize = 4;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single `[1, 3, H, W]` float input and a `[1, 4 + classes, anchors]`
/// output of centre-format boxes followed by per-class scores.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    candidate_confidence: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            candidate_confidence: DEFAULT_CANDIDATE_CONFIDENCE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the NMS IoU threshold.
    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(frame.image(), self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape().to_vec();
        let preds = preds
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|_| anyhow!("unexpected detector output shape {:?}", shape))?;
        let (_, channels, anchors) = preds.dim();
        if channels <= BOX_OFFSET {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }

        let sx = frame.width() as f32 / self.width as f32;
        let sy = frame.height() as f32 / self.height as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (class_id, confidence) = (BOX_OFFSET..channels)
                .map(|c| (c - BOX_OFFSET, preds[[0, c, i]]))
                .fold((0usize, f32::NEG_INFINITY), |best, x| {
                    if x.1 > best.1 {
                        x
                    } else {
                        best
                    }
                });
            if !confidence.is_finite() || confidence < self.candidate_confidence {
                continue;
            }
            let bbox = BoundingBox::from_center(
                preds[[0, 0, i]],
                preds[[0, 1, i]],
                preds[[0, 2, i]],
                preds[[0, 3, i]],
            )
            .scaled(sx, sy)
            .clamped(frame.width(), frame.height());
            candidates.push(Detection::new(
                label_for(class_id),
                confidence.min(1.0),
                bbox,
            ));
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Greedy per-label NMS, highest confidence first.
fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.label == candidate.label && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::filled(0, self.width, self.height, [0, 0, 0]);
        self.detect(&blank).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_best_of_overlapping_same_label() {
        let a = Detection::new("car", 0.9, BoundingBox::new(0.0, 0.0, 100.0, 50.0));
        let b = Detection::new("car", 0.6, BoundingBox::new(5.0, 0.0, 105.0, 50.0));
        let c = Detection::new("person", 0.8, BoundingBox::new(5.0, 0.0, 105.0, 50.0));
        let kept = non_max_suppression(vec![b, a.clone(), c.clone()], 0.45);
        assert_eq!(kept, vec![a, c]);
    }
}
