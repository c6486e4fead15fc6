//! Rule-based anomaly reconciliation.
//!
//! Rules in [`Rule::ORDER`] run independently against the summarized
//! detections, the confidence-filtered objects and the image identifier. Each
//! fired rule appends its tags in evaluation order.

mod rules;

use serde::Serialize;

use crate::detect::{DetectedObject, DetectionSummary};

pub use rules::{KnownCases, Rule, RuleContext};

/// Tag reported when no rule fires.
pub const NO_ANOMALY: &str = "no visible anomaly";

/// Tags produced by the rule engine.
///
/// Either at least one rule fired and `count == tags.len()`, or no rule fired
/// and the report is exactly `["no visible anomaly"]` with a count of zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnomalyReport {
    #[serde(rename = "anomalies_detected")]
    tags: Vec<String>,
    count: usize,
}

impl AnomalyReport {
    pub fn from_tags(tags: Vec<String>) -> Self {
        if tags.is_empty() {
            return Self::nominal();
        }
        let count = tags.len();
        Self { tags, count }
    }

    pub fn nominal() -> Self {
        Self {
            tags: vec![NO_ANOMALY.to_string()],
            count: 0,
        }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_nominal(&self) -> bool {
        self.count == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuleEngine {
    known_cases: KnownCases,
}

impl RuleEngine {
    pub fn new(known_cases: KnownCases) -> Self {
        Self { known_cases }
    }

    pub fn known_cases(&self) -> &KnownCases {
        &self.known_cases
    }

    /// Evaluate every rule. `objects` must already be confidence-filtered.
    pub fn evaluate(
        &self,
        image_id: &str,
        summary: &DetectionSummary,
        objects: &[DetectedObject],
    ) -> AnomalyReport {
        let ctx = RuleContext::new(image_id, summary, objects, &self.known_cases);
        let mut tags = Vec::new();
        for rule in Rule::ORDER {
            let fired = rule.evaluate(&ctx);
            if !fired.is_empty() {
                log::debug!("rule {} fired: {:?}", rule.name(), fired);
            }
            tags.extend(fired);
        }
        AnomalyReport::from_tags(tags)
    }
}
