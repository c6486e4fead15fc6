use std::collections::BTreeMap;

use crate::detect::{DetectedObject, DetectionSummary};

const VERY_LARGE_CROWD: u32 = 30;
const LARGE_CROWD: u32 = 20;
const OVERLOADED_BOAT_PERSONS: u32 = 10;
const JET_MIN_ASPECT_RATIO: f32 = 2.0;

const WEAPON_LABELS: [&str; 4] = ["gun", "weapon", "rifle", "firearm"];
const AIRCRAFT_LABELS: [&str; 2] = ["airplane", "fighter jet"];
const FILENAME_CUES: [&str; 2] = ["suspicious", "unknown"];

/// Expected aircraft counts for specific reference images.
///
/// Keys are lower-cased fragments matched as substrings of the image
/// identifier. This is calibration data; it is empty unless configured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownCases {
    expected: BTreeMap<String, u32>,
}

impl KnownCases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fragment: &str, expected_count: u32) {
        self.expected
            .insert(fragment.trim().to_lowercase(), expected_count);
    }

    pub fn with(mut self, fragment: &str, expected_count: u32) -> Self {
        self.insert(fragment, expected_count);
        self
    }

    /// Expected count for the longest fragment contained in `image_id_lower`.
    pub fn expected_for(&self, image_id_lower: &str) -> Option<u32> {
        self.expected
            .iter()
            .filter(|(fragment, _)| !fragment.is_empty() && image_id_lower.contains(fragment.as_str()))
            .max_by_key(|(fragment, _)| fragment.len())
            .map(|(_, expected)| *expected)
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.expected.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<S: AsRef<str>> FromIterator<(S, u32)> for KnownCases {
    fn from_iter<I: IntoIterator<Item = (S, u32)>>(iter: I) -> Self {
        let mut cases = Self::new();
        for (fragment, expected) in iter {
            cases.insert(fragment.as_ref(), expected);
        }
        cases
    }
}

/// Inputs every rule may inspect.
pub struct RuleContext<'a> {
    image_id: String,
    pub summary: &'a DetectionSummary,
    /// Confidence-filtered objects.
    pub objects: &'a [DetectedObject],
    pub known_cases: &'a KnownCases,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        image_id: &str,
        summary: &'a DetectionSummary,
        objects: &'a [DetectedObject],
        known_cases: &'a KnownCases,
    ) -> Self {
        Self {
            image_id: image_id.to_lowercase(),
            summary,
            objects,
            known_cases,
        }
    }

    /// Lower-cased image identifier.
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    fn persons(&self) -> u32 {
        self.summary.count("person")
    }
}

/// Anomaly heuristics, in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rule {
    Crowd,
    Weapon,
    OverloadedBoat,
    UnauthorizedRaft,
    Drone,
    Fire,
    Smoke,
    MissingLifeboat,
    SuspiciousFilename,
    Aircraft,
}

impl Rule {
    pub const ORDER: [Rule; 10] = [
        Rule::Crowd,
        Rule::Weapon,
        Rule::OverloadedBoat,
        Rule::UnauthorizedRaft,
        Rule::Drone,
        Rule::Fire,
        Rule::Smoke,
        Rule::MissingLifeboat,
        Rule::SuspiciousFilename,
        Rule::Aircraft,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Rule::Crowd => "crowd",
            Rule::Weapon => "weapon",
            Rule::OverloadedBoat => "overloaded_boat",
            Rule::UnauthorizedRaft => "unauthorized_raft",
            Rule::Drone => "drone",
            Rule::Fire => "fire",
            Rule::Smoke => "smoke",
            Rule::MissingLifeboat => "missing_lifeboat",
            Rule::SuspiciousFilename => "suspicious_filename",
            Rule::Aircraft => "aircraft",
        }
    }

    /// Tags this rule contributes. Only [`Rule::Aircraft`] can emit more than one.
    pub fn evaluate(self, ctx: &RuleContext<'_>) -> Vec<String> {
        match self {
            Rule::Crowd => crowd(ctx).into_iter().collect(),
            Rule::Weapon => weapon(ctx).into_iter().collect(),
            Rule::OverloadedBoat => overloaded_boat(ctx).into_iter().collect(),
            Rule::UnauthorizedRaft => unauthorized_raft(ctx).into_iter().collect(),
            Rule::Drone => present(ctx, "drone", "unauthorized drone detected"),
            Rule::Fire => present(ctx, "fire", "fire hazard detected"),
            Rule::Smoke => present(ctx, "smoke", "engine smoke detected"),
            Rule::MissingLifeboat => missing_lifeboat(ctx).into_iter().collect(),
            Rule::SuspiciousFilename => suspicious_filename(ctx).into_iter().collect(),
            Rule::Aircraft => aircraft(ctx),
        }
    }
}

fn crowd(ctx: &RuleContext<'_>) -> Option<String> {
    let persons = ctx.persons();
    if persons >= VERY_LARGE_CROWD {
        Some("very large crowd".to_string())
    } else if persons >= LARGE_CROWD {
        Some("large crowd".to_string())
    } else {
        None
    }
}

fn weapon(ctx: &RuleContext<'_>) -> Option<String> {
    WEAPON_LABELS
        .iter()
        .any(|label| ctx.summary.count(label) > 0)
        .then(|| "firearm detected".to_string())
}

fn overloaded_boat(ctx: &RuleContext<'_>) -> Option<String> {
    (ctx.summary.count("boat") > 0 && ctx.persons() >= OVERLOADED_BOAT_PERSONS)
        .then(|| "overloaded boat".to_string())
}

fn unauthorized_raft(ctx: &RuleContext<'_>) -> Option<String> {
    (ctx.image_id().contains("raft") && ctx.persons() > 0)
        .then(|| "unauthorized raft movement".to_string())
}

fn present(ctx: &RuleContext<'_>, label: &str, tag: &str) -> Vec<String> {
    if ctx.summary.count(label) > 0 {
        vec![tag.to_string()]
    } else {
        Vec::new()
    }
}

fn missing_lifeboat(ctx: &RuleContext<'_>) -> Option<String> {
    (ctx.summary.count("ship") > 0 && ctx.summary.count("boat") == 0)
        .then(|| "lifeboat missing".to_string())
}

fn suspicious_filename(ctx: &RuleContext<'_>) -> Option<String> {
    FILENAME_CUES
        .iter()
        .any(|cue| ctx.image_id().contains(cue))
        .then(|| "unknown vessel or object".to_string())
}

fn aircraft(ctx: &RuleContext<'_>) -> Vec<String> {
    let aircraft_count: u32 = AIRCRAFT_LABELS
        .iter()
        .map(|label| ctx.summary.count(label))
        .sum();
    if aircraft_count == 0 {
        return Vec::new();
    }

    let mut tags = Vec::new();
    if let Some(expected) = ctx.known_cases.expected_for(ctx.image_id()) {
        if aircraft_count != expected {
            tags.push(format!(
                "unexpected jet count: {} detected, expected {}",
                aircraft_count, expected
            ));
        }
    }

    for obj in ctx.objects {
        let label = obj.label.to_lowercase();
        if AIRCRAFT_LABELS.contains(&label.as_str())
            && obj.bbox.aspect_ratio() < JET_MIN_ASPECT_RATIO
        {
            tags.push("irregular jet shape detected".to_string());
        }
    }
    tags
}
