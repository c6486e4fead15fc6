use anyhow::{anyhow, Result};

use crate::detect::{DetectedObject, DetectionOutput, DetectionParams};
use crate::image_input::ImageInput;
use crate::stage::backend::{Caption, Captioner, Classification, Classifier, ObjectDetector, StageKind};

/// Scripted backend for tests and dry runs.
///
/// Replies verbatim with whatever it was configured with, for every image.
/// Detections are not thresholded.
#[derive(Clone, Debug)]
pub struct StubBackend {
    classification: Classification,
    caption: Caption,
    detections: DetectionOutput,
    failures: Vec<(StageKind, String)>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            classification: Classification {
                label: "naval patrol".to_string(),
                confidence: 0.5,
            },
            caption: Caption::from_text("a ship sailing in the ocean"),
            detections: DetectionOutput::default(),
            failures: Vec::new(),
        }
    }

    pub fn with_classification(mut self, label: &str, confidence: f32) -> Self {
        self.classification = Classification {
            label: label.to_string(),
            confidence,
        };
        self
    }

    pub fn with_caption(mut self, text: &str) -> Self {
        self.caption = Caption::from_text(text);
        self
    }

    pub fn with_objects(mut self, objects: Vec<DetectedObject>) -> Self {
        self.detections = DetectionOutput::from_objects(objects);
        self
    }

    /// Make `stage` fail with `cause` on every call.
    pub fn failing(mut self, stage: StageKind, cause: &str) -> Self {
        self.failures.push((stage, cause.to_string()));
        self
    }

    fn check(&self, stage: StageKind) -> Result<()> {
        match self.failures.iter().find(|(kind, _)| *kind == stage) {
            Some((_, cause)) => Err(anyhow!("{}", cause)),
            None => Ok(()),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&mut self, _image: &ImageInput, _labels: &[String]) -> Result<Classification> {
        self.check(StageKind::Classification)?;
        Ok(self.classification.clone())
    }
}

impl Captioner for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn caption(&mut self, _image: &ImageInput) -> Result<Caption> {
        self.check(StageKind::Caption)?;
        Ok(self.caption.clone())
    }
}

impl ObjectDetector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &ImageInput, _params: DetectionParams) -> Result<DetectionOutput> {
        self.check(StageKind::Detection)?;
        Ok(self.detections.clone())
    }
}
