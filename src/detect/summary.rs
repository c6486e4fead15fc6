use std::collections::BTreeMap;

use serde::Serialize;

use crate::detect::result::DetectedObject;

/// Default confidence floor (percent) below which detections are ignored.
pub const MIN_CONFIDENCE: f64 = 40.0;

/// Lower-cased label -> occurrence count.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DetectionSummary {
    counts: BTreeMap<String, u32>,
}

impl DetectionSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from label/count pairs. Labels differing only by case are merged.
    pub fn from_counts<I, S>(counts: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: AsRef<str>,
    {
        let mut summary = Self::new();
        for (label, count) in counts {
            summary.add(label.as_ref(), count);
        }
        summary
    }

    fn add(&mut self, label: &str, count: u32) {
        *self.counts.entry(label.to_lowercase()).or_insert(0) += count;
    }

    /// Count for `label`; absent labels count as zero.
    pub fn count(&self, label: &str) -> u32 {
        self.counts
            .get(label.to_lowercase().as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(label, count)| (label.as_str(), *count))
    }
}

/// Objects at or above `min_confidence`, in detector order.
///
/// This is the only place detections are filtered; downstream rules receive
/// the result as-is.
pub fn confident_objects(objects: &[DetectedObject], min_confidence: f64) -> Vec<DetectedObject> {
    objects
        .iter()
        .filter(|obj| obj.confidence.percent() >= min_confidence)
        .cloned()
        .collect()
}

/// Count surviving objects per case-folded label.
pub fn summarize(objects: &[DetectedObject], min_confidence: f64) -> DetectionSummary {
    let mut summary = DetectionSummary::new();
    for obj in objects
        .iter()
        .filter(|obj| obj.confidence.percent() >= min_confidence)
    {
        summary.add(&obj.label, 1);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(label: &str, confidence: f64) -> DetectedObject {
        DetectedObject::new(label, confidence, [0.0, 0.0, 10.0, 10.0])
    }

    #[test]
    fn empty_input_gives_empty_summary() {
        assert!(summarize(&[], MIN_CONFIDENCE).is_empty());
    }

    #[test]
    fn drops_low_confidence_and_folds_case() {
        let objects = vec![
            obj("Person", 91.0),
            obj("person", 40.0),
            obj("PERSON", 39.9),
            obj("Boat", 55.0),
        ];
        let summary = summarize(&objects, MIN_CONFIDENCE);
        assert_eq!(summary.count("person"), 2);
        assert_eq!(summary.count("BOAT"), 1);
        assert_eq!(summary.count("drone"), 0);
        assert_eq!(summary.len(), 2);
    }

    #[test]
    fn just_under_the_floor_is_dropped() {
        let objects: Vec<DetectedObject> = serde_json::from_value(serde_json::json!([
            { "label": "fire", "confidence": 39.9999999, "bbox": [0, 0, 10, 10] },
            { "label": "fire", "confidence": "39.9999999%", "bbox": [0, 0, 10, 10] },
            { "label": "smoke", "confidence": "40.0%", "bbox": [0, 0, 10, 10] }
        ]))
        .unwrap();
        let summary = summarize(&objects, MIN_CONFIDENCE);
        assert_eq!(summary.count("fire"), 0);
        assert_eq!(summary.count("smoke"), 1);
        assert_eq!(confident_objects(&objects, MIN_CONFIDENCE).len(), 1);
    }

    #[test]
    fn confident_objects_keep_order() {
        let objects = vec![obj("ship", 80.0), obj("boat", 10.0), obj("fire", 45.0)];
        let kept = confident_objects(&objects, MIN_CONFIDENCE);
        let labels: Vec<&str> = kept.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["ship", "fire"]);
    }

    #[test]
    fn from_counts_merges_case_variants() {
        let summary = DetectionSummary::from_counts([("Airplane", 2), ("airplane", 1)]);
        assert_eq!(summary.count("airplane"), 3);
        assert_eq!(summary.iter().collect::<Vec<_>>(), vec![("airplane", 3)]);
    }
}
