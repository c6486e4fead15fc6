#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::{DetectionOutput, DetectionParams};
use crate::image_input::ImageInput;
use crate::stage::backend::{Classification, Classifier, ObjectDetector};

use super::postprocess::{best_label, decode_yolo, YoloLayout};

type OnnxPlan = TypedRunnableModel<TypedModel>;

fn load_plan(model_path: &Path, input_size: u32) -> Result<OnnxPlan> {
    let size = input_size as usize;
    tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

/// Square-resized, `[0, 1]`-scaled NCHW tensor.
fn build_input(image: &ImageInput, input_size: u32) -> Tensor {
    let rgb = image
        .image()
        .resize_exact(input_size, input_size, FilterType::Triangle)
        .to_rgb8();
    let size = input_size as usize;
    tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
        rgb.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
    })
    .into_tensor()
}

fn run_plan(plan: &OnnxPlan, input: Tensor) -> Result<(Vec<usize>, Vec<f32>)> {
    let outputs = plan.run(tvec!(input.into())).context("ONNX inference failed")?;
    let output = outputs
        .first()
        .ok_or_else(|| anyhow!("model produced no outputs"))?;
    let view = output
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?;
    Ok((view.shape().to_vec(), view.iter().copied().collect()))
}

/// ONNX image classifier scored against the configured label set.
///
/// The model's output head must have one logit per label, in label order.
pub struct TractClassifier {
    plan: OnnxPlan,
    input_size: u32,
}

impl TractClassifier {
    pub fn load<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        Ok(Self {
            plan: load_plan(model_path.as_ref(), input_size)?,
            input_size,
        })
    }
}

impl Classifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn classify(&mut self, image: &ImageInput, labels: &[String]) -> Result<Classification> {
        let (_, logits) = run_plan(&self.plan, build_input(image, self.input_size))?;
        best_label(labels, &logits)
    }
}

/// YOLOv8-style ONNX detector.
pub struct TractDetector {
    plan: OnnxPlan,
    labels: Vec<String>,
    input_size: u32,
}

impl TractDetector {
    /// `labels_path` lists one class name per line, in model class order.
    pub fn load<P: AsRef<Path>, L: AsRef<Path>>(
        model_path: P,
        labels_path: L,
        input_size: u32,
    ) -> Result<Self> {
        let labels_path = labels_path.as_ref();
        let labels = std::fs::read_to_string(labels_path)
            .with_context(|| format!("failed to read labels {}", labels_path.display()))?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            plan: load_plan(model_path.as_ref(), input_size)?,
            labels,
            input_size,
        })
    }
}

impl ObjectDetector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &ImageInput, params: DetectionParams) -> Result<DetectionOutput> {
        let (shape, data) = run_plan(&self.plan, build_input(image, self.input_size))?;
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("expected output shape [1, C, N], got {:?}", shape));
        }
        let (image_width, image_height) = image.dimensions();
        let layout = YoloLayout {
            channels: shape[1],
            boxes: shape[2],
            input_size: self.input_size,
            image_width,
            image_height,
        };
        let objects = decode_yolo(&data, &layout, &self.labels, params)?;
        log::debug!("tract detector kept {} boxes for {}", objects.len(), image.name());
        Ok(DetectionOutput::from_objects(objects))
    }
}
