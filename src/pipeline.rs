//! Per-image orchestration.
//!
//! Classification, captioning and detection have no data dependency on each
//! other and run concurrently by default. The run fails as a whole if any of
//! them fails; there are no partial results. Detection output then flows
//! through the summarizer, the rule engine and the synthesizer.

use std::panic::AssertUnwindSafe;
use std::thread::ScopedJoinHandle;

use serde::Serialize;
use thiserror::Error;

use crate::anomaly::{AnomalyReport, RuleEngine};
use crate::assessment::{synthesize, Assessment};
use crate::config::NavalConfig;
use crate::detect::{
    confident_objects, summarize, DetectionOutput, DetectionParams, MIN_CONFIDENCE,
};
use crate::image_input::{FileInfo, ImageInput};
use crate::stage::{Caption, Classification, StageKind, StageSet};

/// Labels offered to the classification stage.
pub const DEFAULT_LABELS: [&str; 24] = [
    "aircraft carrier",
    "destroyer",
    "frigate",
    "submarine",
    "fighter jet",
    "drone",
    "cargo ship",
    "tanker",
    "patrol boat",
    "helicopter",
    "missile",
    "torpedo",
    "lifeboat",
    "supply vessel",
    "amphibious assault ship",
    "Crew member",
    "naval officer",
    "naval base",
    "naval exercise",
    "naval patrol",
    "naval surveillance",
    "naval operation",
    "naval fleet",
    "naval patrol aircraft",
];

#[derive(Debug, Error)]
pub enum PipelineError {
    /// An inference stage reported an error, panicked, could not load its
    /// model, or returned a payload that breaks its contract.
    #[error("{stage} failed: {cause}")]
    StageFailure { stage: StageKind, cause: String },
    /// The image could not be accepted.
    #[error("{0}")]
    InvalidInput(String),
}

impl PipelineError {
    pub fn stage(stage: StageKind, err: anyhow::Error) -> Self {
        PipelineError::StageFailure {
            stage,
            cause: format!("{err:#}"),
        }
    }

    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            PipelineError::StageFailure { stage, .. } => Some(*stage),
            PipelineError::InvalidInput(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub labels: Vec<String>,
    pub detection: DetectionParams,
    /// Confidence floor (percent) for the anomaly rules.
    pub min_confidence: f64,
    pub parallel_stages: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
            detection: DetectionParams::default(),
            min_confidence: MIN_CONFIDENCE,
            parallel_stages: true,
        }
    }
}

/// Everything produced for one image.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineResult {
    file_info: FileInfo,
    classification: Classification,
    caption: Caption,
    detections: DetectionOutput,
    #[serde(rename = "anomalies_detected")]
    anomalies: AnomalyReport,
    #[serde(rename = "naval_assessment")]
    assessment: Assessment,
}

impl PipelineResult {
    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn caption(&self) -> &Caption {
        &self.caption
    }

    pub fn detections(&self) -> &DetectionOutput {
        &self.detections
    }

    pub fn anomalies(&self) -> &AnomalyReport {
        &self.anomalies
    }

    pub fn assessment(&self) -> &Assessment {
        &self.assessment
    }
}

/// Stage backends plus the rule engine. Safe to share across request threads;
/// every run owns its intermediate data.
pub struct Pipeline {
    stages: StageSet,
    settings: PipelineSettings,
    engine: RuleEngine,
}

impl Pipeline {
    pub fn new(stages: StageSet, settings: PipelineSettings, engine: RuleEngine) -> Self {
        Self {
            stages,
            settings,
            engine,
        }
    }

    pub fn from_config(cfg: &NavalConfig) -> anyhow::Result<Self> {
        let stages = StageSet::from_settings(&cfg.backends)?;
        Ok(Self::new(
            stages,
            cfg.pipeline_settings(),
            RuleEngine::new(cfg.known_cases.clone()),
        ))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Load models up front instead of on the first request.
    pub fn warm_up(&self) -> Result<(), PipelineError> {
        self.stages.warm_up()
    }

    pub fn run(&self, image: &ImageInput) -> Result<PipelineResult, PipelineError> {
        let (classification, caption, detections) = if self.settings.parallel_stages {
            let (classification, caption, detections) = self.run_stages_concurrently(image);
            (classification?, caption?, detections?)
        } else {
            (
                catch_stage(StageKind::Classification, || self.classify(image))?,
                catch_stage(StageKind::Caption, || self.caption(image))?,
                catch_stage(StageKind::Detection, || self.detect(image))?,
            )
        };

        detections.validate().map_err(|err| {
            let err = PipelineError::stage(
                StageKind::Detection,
                err.context("malformed detection output"),
            );
            log::warn!("{} rejected: {}", image.name(), err);
            err
        })?;

        let min_confidence = self.settings.min_confidence;
        let summary = summarize(&detections.objects_detected, min_confidence);
        let confident = confident_objects(&detections.objects_detected, min_confidence);
        let anomalies = self.engine.evaluate(image.name(), &summary, &confident);
        let assessment = synthesize(&anomalies);

        log::info!(
            "{}: {:?}/{:?}, {} anomalies ({} of {} detections above {:.1}%)",
            image.name(),
            assessment.status,
            assessment.priority,
            anomalies.count(),
            confident.len(),
            detections.objects_detected.len(),
            min_confidence
        );

        Ok(PipelineResult {
            file_info: image.file_info(),
            classification,
            caption,
            detections,
            anomalies,
            assessment,
        })
    }

    #[allow(clippy::type_complexity)]
    fn run_stages_concurrently(
        &self,
        image: &ImageInput,
    ) -> (
        Result<Classification, PipelineError>,
        Result<Caption, PipelineError>,
        Result<DetectionOutput, PipelineError>,
    ) {
        std::thread::scope(|scope| {
            let classification = scope.spawn(|| self.classify(image));
            let caption = scope.spawn(|| self.caption(image));
            let detections = scope.spawn(|| self.detect(image));
            (
                join_stage(classification, StageKind::Classification),
                join_stage(caption, StageKind::Caption),
                join_stage(detections, StageKind::Detection),
            )
        })
    }

    fn classify(&self, image: &ImageInput) -> Result<Classification, PipelineError> {
        let labels = &self.settings.labels;
        let outcome = self
            .stages
            .classifier()
            .with(|backend| backend.classify(image, labels));
        finish_stage(StageKind::Classification, image, outcome)
    }

    fn caption(&self, image: &ImageInput) -> Result<Caption, PipelineError> {
        let outcome = self
            .stages
            .captioner()
            .with(|backend| backend.caption(image));
        finish_stage(StageKind::Caption, image, outcome)
    }

    fn detect(&self, image: &ImageInput) -> Result<DetectionOutput, PipelineError> {
        let params = self.settings.detection;
        let outcome = self
            .stages
            .detector()
            .with(|backend| backend.detect(image, params));
        finish_stage(StageKind::Detection, image, outcome)
    }
}

fn finish_stage<T>(
    stage: StageKind,
    image: &ImageInput,
    outcome: anyhow::Result<T>,
) -> Result<T, PipelineError> {
    match outcome {
        Ok(value) => {
            log::debug!("{} finished for {}", stage, image.name());
            Ok(value)
        }
        Err(err) => {
            log::warn!("{} failed for {}: {:#}", stage, image.name(), err);
            Err(PipelineError::stage(stage, err))
        }
    }
}

fn join_stage<T>(
    handle: ScopedJoinHandle<'_, Result<T, PipelineError>>,
    stage: StageKind,
) -> Result<T, PipelineError> {
    handle.join().unwrap_or_else(|_| Err(stage_panicked(stage)))
}

fn catch_stage<T>(
    stage: StageKind,
    run: impl FnOnce() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    std::panic::catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|_| Err(stage_panicked(stage)))
}

/// A panicking backend also poisons its slot; later runs fail on the lock.
fn stage_panicked(stage: StageKind) -> PipelineError {
    log::warn!("{} stage panicked", stage);
    PipelineError::StageFailure {
        stage,
        cause: "stage panicked".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::KnownCases;
    use crate::assessment::{Priority, Status};
    use crate::detect::DetectedObject;
    use crate::stage::{Captioner, Classifier, ObjectDetector, StubBackend};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn image(name: &str) -> ImageInput {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(32, 24))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        ImageInput::from_bytes(name, &out.into_inner()).unwrap()
    }

    fn pipeline(backend: StubBackend, parallel: bool) -> Pipeline {
        let settings = PipelineSettings {
            parallel_stages: parallel,
            ..PipelineSettings::default()
        };
        Pipeline::new(
            StageSet::stub(backend),
            settings,
            RuleEngine::new(KnownCases::new().with("1027565", 2)),
        )
    }

    #[test]
    fn quiet_scene_is_nominal() {
        for parallel in [true, false] {
            let result = pipeline(StubBackend::new(), parallel)
                .run(&image("harbor.png"))
                .unwrap();
            assert!(result.anomalies().is_nominal());
            assert_eq!(result.assessment().status, Status::Nominal);
            assert_eq!(result.file_info().size, [32, 24]);
        }
    }

    #[test]
    fn low_confidence_detections_do_not_trigger_rules() {
        let backend = StubBackend::new().with_objects(vec![
            DetectedObject::new("fire", 39.0, [0.0, 0.0, 5.0, 5.0]),
            DetectedObject::new("drone", 41.0, [0.0, 0.0, 5.0, 5.0]),
        ]);
        let result = pipeline(backend, true).run(&image("deck.png")).unwrap();
        assert_eq!(result.anomalies().tags(), &["unauthorized drone detected".to_string()]);
        assert_eq!(result.assessment().priority, Priority::High);
        // raw detector output is reported untouched
        assert_eq!(result.detections().objects_detected.len(), 2);
        assert_eq!(result.detections().summary.get("fire"), Some(&1));
    }

    #[test]
    fn stage_failure_fails_the_run() {
        for stage in StageKind::ALL {
            for parallel in [true, false] {
                let backend = StubBackend::new().failing(stage, "CUDA out of memory");
                let err = pipeline(backend, parallel).run(&image("a.png")).unwrap_err();
                assert_eq!(err.failed_stage(), Some(stage));
                assert!(err.to_string().contains("CUDA out of memory"));
            }
        }
    }

    /// Panics in one stage, answers like the default stub in the others.
    #[derive(Clone)]
    struct PanicsIn(StageKind, StubBackend);

    impl PanicsIn {
        fn check(&self, stage: StageKind) {
            if self.0 == stage {
                panic!("{stage} backend blew up");
            }
        }
    }

    impl Classifier for PanicsIn {
        fn name(&self) -> &'static str {
            "panics"
        }

        fn classify(
            &mut self,
            image: &ImageInput,
            labels: &[String],
        ) -> anyhow::Result<Classification> {
            self.check(StageKind::Classification);
            self.1.classify(image, labels)
        }
    }

    impl Captioner for PanicsIn {
        fn name(&self) -> &'static str {
            "panics"
        }

        fn caption(&mut self, image: &ImageInput) -> anyhow::Result<Caption> {
            self.check(StageKind::Caption);
            self.1.caption(image)
        }
    }

    impl ObjectDetector for PanicsIn {
        fn name(&self) -> &'static str {
            "panics"
        }

        fn detect(
            &mut self,
            image: &ImageInput,
            params: DetectionParams,
        ) -> anyhow::Result<DetectionOutput> {
            self.check(StageKind::Detection);
            self.1.detect(image, params)
        }
    }

    #[test]
    fn panicking_stage_is_a_stage_failure() {
        for stage in StageKind::ALL {
            for parallel in [true, false] {
                let backend = PanicsIn(stage, StubBackend::new());
                let pipeline = Pipeline::new(
                    StageSet::from_backends(backend.clone(), backend.clone(), backend),
                    PipelineSettings {
                        parallel_stages: parallel,
                        ..PipelineSettings::default()
                    },
                    RuleEngine::default(),
                );
                let err = pipeline.run(&image("a.png")).unwrap_err();
                assert_eq!(err.failed_stage(), Some(stage));
                assert_eq!(err.to_string(), format!("{stage} failed: stage panicked"));

                // the slot stays poisoned; later runs fail instead of panicking
                let err = pipeline.run(&image("a.png")).unwrap_err();
                assert_eq!(err.failed_stage(), Some(stage));
            }
        }
    }

    #[test]
    fn earliest_stage_failure_is_reported() {
        let backend = StubBackend::new()
            .failing(StageKind::Detection, "detector down")
            .failing(StageKind::Caption, "captioner down");
        let err = pipeline(backend, true).run(&image("a.png")).unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageKind::Caption));
        assert_eq!(err.to_string(), "caption generation failed: captioner down");
    }

    #[test]
    fn malformed_detection_is_a_stage_failure() {
        let backend = StubBackend::new().with_objects(vec![DetectedObject::new(
            "boat",
            250.0,
            [0.0, 0.0, 5.0, 5.0],
        )]);
        let err = pipeline(backend, false).run(&image("a.png")).unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageKind::Detection));
        assert!(err.to_string().contains("malformed detection output"));
    }
}
