#![cfg(feature = "backend-onnx")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::detector::Detector;
use crate::detect::result::{BoundingBox, Detection, PPE_CLASSES};
use crate::frame::Frame;

const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based PPE detector for ONNX exports of the trained model.
///
/// Frames are resized to the model input, run through the network, and the
/// output grid is decoded into [`Detection`] records with class names taken
/// from the model vocabulary. Inference is local; no network I/O.
pub struct OnnxDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>,
    input_width: u32,
    input_height: u32,
    confidence_floor: f32,
}

impl OnnxDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_width: u32, input_height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
            confidence_floor: 0.25,
        })
    }

    /// Discard raw rows below `floor` before decoding. The per-frame
    /// threshold from the runtime settings is applied downstream.
    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = floor;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let expected = (frame.width as usize)
            .checked_mul(frame.height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if frame.data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                frame.data.len()
            ));
        }

        let (iw, ih) = (self.input_width as usize, self.input_height as usize);
        let (fw, fh) = (frame.width as usize, frame.height as usize);
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, ih, iw), |(_, channel, y, x)| {
            // nearest-neighbour resample into model space
            let sx = (x * fw / iw).min(fw - 1);
            let sy = (y * fh / ih).min(fh - 1);
            frame.data[(sy * fw + sx) * 3 + channel] as f32 / 255.0
        });

        Ok(input.into_tensor())
    }

    fn decode_output(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;

        let shape = view.shape();
        // expected layout: [1, 4 + classes, rows]
        if shape.len() != 3 || shape[1] != 4 + PPE_CLASSES.len() {
            return Err(anyhow!(
                "unexpected model output shape {:?}, want [1, {}, N]",
                shape,
                4 + PPE_CLASSES.len()
            ));
        }

        let rows = shape[2];
        let x_scale = frame.width as f32 / self.input_width as f32;
        let y_scale = frame.height as f32 / self.input_height as f32;
        let mut candidates = Vec::new();

        for row in 0..rows {
            let mut best_class = 0usize;
            let mut best_score = 0.0f32;
            for class in 0..PPE_CLASSES.len() {
                let score = view[[0, 4 + class, row]];
                if score > best_score {
                    best_score = score;
                    best_class = class;
                }
            }
            if best_score < self.confidence_floor {
                continue;
            }

            let cx = view[[0, 0, row]] * x_scale;
            let cy = view[[0, 1, row]] * y_scale;
            let w = view[[0, 2, row]] * x_scale;
            let h = view[[0, 3, row]] * y_scale;
            let x1 = (cx - w / 2.0).max(0.0) as u32;
            let y1 = (cy - h / 2.0).max(0.0) as u32;
            let x2 = ((cx + w / 2.0) as u32).min(frame.width);
            let y2 = ((cy + h / 2.0) as u32).min(frame.height);

            candidates.push(Detection::new(
                PPE_CLASSES[best_class],
                best_score,
                BoundingBox::new(x1, y1, x2, y2),
            ));
        }

        Ok(non_max_suppress(candidates))
    }
}

impl Detector for OnnxDetector {
    fn name(&self) -> &'static str {
        "onnx-ppe"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode_output(outputs, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::new(
            0,
            self.input_width,
            self.input_height,
            vec![0; self.input_width as usize * self.input_height as usize * 3],
        );
        self.detect(&blank).map(|_| ())
    }
}

/// Greedy per-class suppression of overlapping boxes.
fn non_max_suppress(mut candidates: Vec<Detection>) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_name == candidate.class_name
                && iou(&k.bbox, &candidate.bbox) > NMS_IOU_THRESHOLD
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    if ix2 <= ix1 || iy2 <= iy1 {
        return 0.0;
    }
    let inter = ((ix2 - ix1) as f32) * ((iy2 - iy1) as f32);
    let area_a = (a.width() as f32) * (a.height() as f32);
    let area_b = (b.width() as f32) * (b.height() as f32);
    inter / (area_a + area_b - inter)
}
