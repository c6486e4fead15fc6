use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Detection confidence as a percentage in `[0, 100]`.
///
/// Serialized the way the detector reports it (`"45.5%"`). Deserialization
/// accepts either that form or a bare number; range checks happen in
/// [`DetectedObject::validate`], not here.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Confidence(f64);

impl Confidence {
    pub fn from_percent(percent: f64) -> Self {
        Self(percent)
    }

    /// Build from a detector score in `[0, 1]`.
    pub fn from_score(score: f32) -> Self {
        Self(f64::from(score) * 100.0)
    }

    pub fn percent(self) -> f64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0.is_finite() && (0.0..=100.0).contains(&self.0)
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.0)
    }
}

impl FromStr for Confidence {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_suffix('%').unwrap_or(trimmed).trim_end();
        let percent: f64 = digits
            .parse()
            .map_err(|_| anyhow!("malformed confidence '{}'", raw))?;
        Ok(Self(percent))
    }
}

impl Serialize for Confidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawConfidence {
    Number(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawConfidence::deserialize(deserializer)? {
            RawConfidence::Number(value) => Ok(Self(value)),
            RawConfidence::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

/// Axis-aligned box in image pixel coordinates, `(x1, y1)` top-left.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Width over height; a degenerate (zero or negative) height counts as square.
    pub fn aspect_ratio(&self) -> f32 {
        let height = self.height();
        if height <= 0.0 {
            1.0
        } else {
            self.width() / height
        }
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    fn is_ordered(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x2 >= self.x1
            && self.y2 >= self.y1
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.x1, bbox.y1, bbox.x2, bbox.y2]
    }
}

/// One detected instance reported by the object detection stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: Confidence,
    pub bbox: BoundingBox,
}

impl DetectedObject {
    pub fn new(label: impl Into<String>, confidence_percent: f64, bbox: [f32; 4]) -> Self {
        Self {
            label: label.into(),
            confidence: Confidence::from_percent(confidence_percent),
            bbox: BoundingBox::from(bbox),
        }
    }

    /// Reject records that break the detector contract.
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_valid() {
            return Err(anyhow!(
                "'{}' confidence {} outside [0, 100]",
                self.label,
                self.confidence.percent()
            ));
        }
        if !self.bbox.is_ordered() {
            return Err(anyhow!(
                "'{}' bounding box {:?} is not ordered",
                self.label,
                <[f32; 4]>::from(self.bbox)
            ));
        }
        Ok(())
    }
}

/// Thresholds handed to the detector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionParams {
    /// Minimum detector score in `[0, 1]`.
    pub conf_threshold: f32,
    /// IoU above which overlapping boxes of one class are suppressed.
    pub iou_threshold: f32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            conf_threshold: 0.4,
            iou_threshold: 0.6,
        }
    }
}

/// Raw output of the detection stage.
///
/// `summary` is the detector's own label count over every object it reported,
/// labels as-is. The anomaly rules use [`crate::detect::summarize`] instead.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    pub objects_detected: Vec<DetectedObject>,
    #[serde(default)]
    pub summary: BTreeMap<String, u32>,
}

impl DetectionOutput {
    pub fn from_objects(objects: Vec<DetectedObject>) -> Self {
        let mut summary = BTreeMap::new();
        for obj in &objects {
            *summary.entry(obj.label.clone()).or_insert(0) += 1;
        }
        Self {
            objects_detected: objects,
            summary,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for obj in &self.objects_detected {
            obj.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn confidence_parses_percent_strings_and_numbers() {
        let obj: DetectedObject = serde_json::from_value(json!({
            "label": "airplane",
            "confidence": "45.5%",
            "bbox": [100.0, 100.0, 200.0, 200.0]
        }))
        .unwrap();
        assert_eq!(obj.confidence.percent(), 45.5);

        let obj: DetectedObject = serde_json::from_value(json!({
            "label": "boat",
            "confidence": 71.25,
            "bbox": [0, 0, 10, 5]
        }))
        .unwrap();
        assert_eq!(obj.confidence.percent(), 71.25);
        assert_eq!(obj.bbox.aspect_ratio(), 2.0);
    }

    #[test]
    fn confidence_serializes_like_the_detector() {
        let obj = DetectedObject::new("ship", 87.5, [1.0, 2.0, 3.0, 4.0]);
        let value = serde_json::to_value(&obj).unwrap();
        assert_eq!(value["confidence"], "87.5%");
        assert_eq!(value["bbox"], json!([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn malformed_confidence_is_rejected() {
        let err = "high".parse::<Confidence>().unwrap_err();
        assert!(err.to_string().contains("malformed confidence"));

        let obj = DetectedObject::new("fire", 140.0, [0.0, 0.0, 1.0, 1.0]);
        assert!(obj.validate().is_err());
        let obj = DetectedObject::new("fire", f64::NAN, [0.0, 0.0, 1.0, 1.0]);
        assert!(obj.validate().is_err());
    }

    #[test]
    fn unordered_box_is_rejected() {
        let obj = DetectedObject::new("boat", 90.0, [50.0, 0.0, 10.0, 10.0]);
        assert!(obj.validate().unwrap_err().to_string().contains("not ordered"));
    }

    #[test]
    fn flat_box_counts_as_square() {
        let bbox = BoundingBox::new(10.0, 40.0, 90.0, 40.0);
        assert_eq!(bbox.aspect_ratio(), 1.0);
    }

    #[test]
    fn iou_of_overlapping_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn detector_summary_counts_raw_labels() {
        let output = DetectionOutput::from_objects(vec![
            DetectedObject::new("person", 90.0, [0.0, 0.0, 1.0, 1.0]),
            DetectedObject::new("person", 20.0, [0.0, 0.0, 1.0, 1.0]),
            DetectedObject::new("boat", 60.0, [0.0, 0.0, 1.0, 1.0]),
        ]);
        assert_eq!(output.summary.get("person"), Some(&2));
        assert_eq!(output.summary.get("boat"), Some(&1));
    }
}
