#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectorBackend, DetectorLoader};
use crate::detect::result::RawDetection;
use crate::frame::FrameView;
use crate::geometry::AxisAlignedRect;

/// Tract-based backend for SSD-style ONNX object detectors.
///
/// Expected model contract:
/// - input: `f32[1, H, W, 3]`, RGB scaled to `0..1`
/// - output 0: boxes `f32[1, N, 4]` as normalized `y1, x1, y2, x2`
/// - output 1: scores `f32[1, N]`
/// - output 2: class ids `f32[1, N]`, indices into the label vocabulary
///
/// Boxes are scaled back into frame pixel space. No confidence filtering
/// happens here.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    labels: Vec<String>,
    input_width: u32,
    input_height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        labels: Vec<String>,
        input_width: u32,
        input_height: u32,
    ) -> Result<Self> {
        if labels.is_empty() {
            return Err(anyhow!("tract backend requires a non-empty label vocabulary"));
        }
        if input_width == 0 || input_height == 0 {
            return Err(anyhow!("model input dimensions must be non-zero"));
        }
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, input_height as usize, input_width as usize, 3),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            labels,
            input_width,
            input_height,
        })
    }

    /// Nearest-neighbour resize into the model's input grid.
    fn build_input(&self, frame: &FrameView<'_>) -> Result<Tensor> {
        let (src_w, src_h) = (frame.width() as usize, frame.height() as usize);
        if src_w == 0 || src_h == 0 {
            return Err(anyhow!("cannot run inference on an empty frame"));
        }
        let pixels = frame.pixels();
        let (dst_w, dst_h) = (self.input_width as usize, self.input_height as usize);
        let input = tract_ndarray::Array4::from_shape_fn((1, dst_h, dst_w, 3), |(_, y, x, c)| {
            let sx = (x * src_w / dst_w).min(src_w - 1);
            let sy = (y * src_h / dst_h).min(src_h - 1);
            pixels[(sy * src_w + sx) * 3 + c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn label_for(&self, class_id: f32) -> &str {
        let last = self.labels.len() - 1;
        let idx = if class_id.is_finite() && class_id > 0.0 {
            (class_id as usize).min(last)
        } else {
            0
        };
        &self.labels[idx]
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &FrameView<'_>) -> Result<Vec<RawDetection>> {
        if outputs.len() < 3 {
            return Err(anyhow!(
                "expected boxes, scores and classes outputs, model produced {}",
                outputs.len()
            ));
        }
        let boxes = outputs[0]
            .to_array_view::<f32>()
            .context("boxes tensor was not f32")?;
        let scores = outputs[1]
            .to_array_view::<f32>()
            .context("scores tensor was not f32")?;
        let classes = outputs[2]
            .to_array_view::<f32>()
            .context("classes tensor was not f32")?;

        let boxes: Vec<f32> = boxes.iter().copied().collect();
        let scores: Vec<f32> = scores.iter().copied().collect();
        let classes: Vec<f32> = classes.iter().copied().collect();
        if boxes.len() < scores.len() * 4 || classes.len() < scores.len() {
            return Err(anyhow!(
                "inconsistent output shapes: {} boxes values, {} scores, {} classes",
                boxes.len(),
                scores.len(),
                classes.len()
            ));
        }

        let (w, h) = (frame.width() as f32, frame.height() as f32);
        let detections = scores
            .iter()
            .enumerate()
            .map(|(i, &score)| {
                let y1 = boxes[i * 4] * h;
                let x1 = boxes[i * 4 + 1] * w;
                let y2 = boxes[i * 4 + 2] * h;
                let x2 = boxes[i * 4 + 3] * w;
                RawDetection::new(
                    self.label_for(classes[i]),
                    score,
                    AxisAlignedRect::new(x1, y1, x2 - x1, y2 - y1),
                )
            })
            .collect();
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &FrameView<'_>) -> Result<Vec<RawDetection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}

/// Loads a `TractBackend` from a model file on first use.
pub struct TractLoader {
    model_path: PathBuf,
    labels: Vec<String>,
    input_width: u32,
    input_height: u32,
}

impl TractLoader {
    pub fn new(
        model_path: impl Into<PathBuf>,
        labels: Vec<String>,
        input_width: u32,
        input_height: u32,
    ) -> Self {
        Self {
            model_path: model_path.into(),
            labels,
            input_width,
            input_height,
        }
    }
}

impl DetectorLoader for TractLoader {
    fn name(&self) -> &str {
        "tract"
    }

    fn load(&self) -> Result<Box<dyn DetectorBackend>> {
        let backend = TractBackend::new(
            &self.model_path,
            self.labels.clone(),
            self.input_width,
            self.input_height,
        )?;
        Ok(Box::new(backend))
    }
}
