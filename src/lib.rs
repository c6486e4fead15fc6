//! Naval Watch
//!
//! Single-image naval surveillance analysis. An image runs through three
//! black-box inference stages, and the detector output then feeds a
//! rule-based anomaly engine and an assessment synthesizer.
//!
//! # Pipeline
//!
//! 1. **Stages**: classification, captioning and object detection run
//!    concurrently against the same decoded image. Any stage failure fails the
//!    whole run.
//! 2. **Summarizer**: detections under the confidence floor (40% by default)
//!    are dropped and the rest counted per label.
//! 3. **Rule engine**: ten ordered heuristic rules turn the summary into
//!    anomaly tags.
//! 4. **Synthesizer**: tags map to a status, a priority and a recommendation.
//!
//! # Module Structure
//!
//! - `detect`: detection records, confidence values, the summarizer
//! - `stage`: stage traits, model slots, stub/replay/tract backends
//! - `anomaly`: the rule table and the engine
//! - `assessment`: the synthesizer
//! - `pipeline`: per-image orchestration
//! - `image_input`: upload intake and decoding
//! - `config`: file and environment configuration
//! - `api`: HTTP upload endpoint

pub mod anomaly;
pub mod api;
pub mod assessment;
pub mod config;
pub mod detect;
pub mod image_input;
pub mod pipeline;
pub mod stage;

pub use anomaly::{AnomalyReport, KnownCases, Rule, RuleEngine, NO_ANOMALY};
pub use assessment::{synthesize, Assessment, Priority, Recommendation, Status};
pub use config::NavalConfig;
pub use detect::{
    summarize, BoundingBox, Confidence, DetectedObject, DetectionOutput, DetectionParams,
    DetectionSummary, MIN_CONFIDENCE,
};
pub use image_input::{FileInfo, ImageInput};
pub use pipeline::{Pipeline, PipelineError, PipelineResult, PipelineSettings};
pub use stage::{BackendKind, BackendSettings, StageKind, StageSet, StubBackend};
