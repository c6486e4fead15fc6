use std::fmt;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detect::{DetectionOutput, DetectionParams};
use crate::image_input::ImageInput;

const DEFAULT_CAPTION_CONFIDENCE: &str = "85.0%";

/// The three independent inference stages run per image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Classification,
    Caption,
    Detection,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::Classification,
        StageKind::Caption,
        StageKind::Detection,
    ];
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Classification => "classification",
            StageKind::Caption => "caption generation",
            StageKind::Detection => "object detection",
        };
        f.write_str(name)
    }
}

/// Best-matching label from the configured label set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// Free-text description of the scene.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caption {
    #[serde(alias = "label")]
    pub text: String,
    #[serde(default, alias = "objectCount")]
    pub object_count: Option<u32>,
    #[serde(default = "unknown_confidence")]
    pub confidence: String,
}

fn unknown_confidence() -> String {
    "N/A".to_string()
}

impl Caption {
    /// Caption with the object count read out of the text.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            object_count: count_in_caption(&text),
            text,
            confidence: DEFAULT_CAPTION_CONFIDENCE.to_string(),
        }
    }
}

/// First integer mentioned in a caption. Spelled-out numbers are not counted.
pub fn count_in_caption(text: &str) -> Option<u32> {
    static COUNT_RE: OnceLock<Regex> = OnceLock::new();
    let re = COUNT_RE.get_or_init(|| Regex::new(r"\d+").unwrap());
    re.find(text)?.as_str().parse().ok()
}

/// Image classification stage.
///
/// Backends hold loaded model state and may keep scratch buffers between
/// calls, hence `&mut self`. An `Err` is reported as a stage failure; backends
/// never substitute default answers.
pub trait Classifier: Send {
    fn name(&self) -> &'static str;

    fn classify(&mut self, image: &ImageInput, labels: &[String]) -> Result<Classification>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Caption generation stage.
pub trait Captioner: Send {
    fn name(&self) -> &'static str;

    fn caption(&mut self, image: &ImageInput) -> Result<Caption>;

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Object detection stage.
///
/// Confidences are reported in percent; boxes in pixel coordinates of the
/// original image.
pub trait ObjectDetector: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, image: &ImageInput, params: DetectionParams) -> Result<DetectionOutput>;

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
