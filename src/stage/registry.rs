use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::pipeline::PipelineError;

use super::backend::{Captioner, Classifier, ObjectDetector, StageKind};
use super::backends::{ReplayBackend, StubBackend};
use super::slot::ModelSlot;

const DEFAULT_REPLAY_DIR: &str = "replay";
const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Stub,
    Replay,
    Tract,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "replay" => Ok(BackendKind::Replay),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!(
                "unknown backend '{}' (expected stub, replay or tract)",
                other
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Stub => "stub",
            BackendKind::Replay => "replay",
            BackendKind::Tract => "tract",
        };
        f.write_str(name)
    }
}

/// Which backend serves each stage, and where its model files live.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendSettings {
    pub classification: BackendKind,
    pub caption: BackendKind,
    pub detection: BackendKind,
    pub replay_dir: PathBuf,
    pub classifier_model: Option<PathBuf>,
    pub detector_model: Option<PathBuf>,
    pub detector_labels: Option<PathBuf>,
    pub input_size: u32,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self::all(BackendKind::Replay)
    }
}

impl BackendSettings {
    /// Same backend for every stage.
    pub fn all(kind: BackendKind) -> Self {
        Self {
            classification: kind,
            caption: kind,
            detection: kind,
            replay_dir: PathBuf::from(DEFAULT_REPLAY_DIR),
            classifier_model: None,
            detector_model: None,
            detector_labels: None,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.caption == BackendKind::Tract {
            return Err(anyhow!(
                "no tract captioner is available; use stub or replay for captioning"
            ));
        }
        if self.classification == BackendKind::Tract && self.classifier_model.is_none() {
            return Err(anyhow!("tract classification requires backends.classifier_model"));
        }
        if self.detection == BackendKind::Tract
            && (self.detector_model.is_none() || self.detector_labels.is_none())
        {
            return Err(anyhow!(
                "tract detection requires backends.detector_model and backends.detector_labels"
            ));
        }
        if self.input_size == 0 {
            return Err(anyhow!("backends.input_size must be greater than zero"));
        }
        Ok(())
    }
}

/// The three stage backends used by one pipeline.
pub struct StageSet {
    classifier: ModelSlot<dyn Classifier>,
    captioner: ModelSlot<dyn Captioner>,
    detector: ModelSlot<dyn ObjectDetector>,
}

impl StageSet {
    pub fn new(
        classifier: ModelSlot<dyn Classifier>,
        captioner: ModelSlot<dyn Captioner>,
        detector: ModelSlot<dyn ObjectDetector>,
    ) -> Self {
        Self {
            classifier,
            captioner,
            detector,
        }
    }

    pub fn from_backends<C, P, D>(classifier: C, captioner: P, detector: D) -> Self
    where
        C: Classifier + 'static,
        P: Captioner + 'static,
        D: ObjectDetector + 'static,
    {
        Self::new(
            ModelSlot::ready(Box::new(classifier) as Box<dyn Classifier>),
            ModelSlot::ready(Box::new(captioner) as Box<dyn Captioner>),
            ModelSlot::ready(Box::new(detector) as Box<dyn ObjectDetector>),
        )
    }

    /// One scripted backend serving all three stages.
    pub fn stub(backend: StubBackend) -> Self {
        Self::from_backends(backend.clone(), backend.clone(), backend)
    }

    /// Build slots from settings. Model-backed slots load lazily.
    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        settings.validate()?;
        let replay = ReplayBackend::new(&settings.replay_dir);
        let classifier = match settings.classification {
            BackendKind::Stub => ModelSlot::ready(Box::new(StubBackend::new()) as Box<dyn Classifier>),
            BackendKind::Replay => ModelSlot::ready(
                Box::new(replay.clone()) as Box<dyn Classifier>,
            ),
            BackendKind::Tract => tract_classifier(settings)?,
        };
        let captioner = match settings.caption {
            BackendKind::Stub => ModelSlot::ready(Box::new(StubBackend::new()) as Box<dyn Captioner>),
            BackendKind::Replay => ModelSlot::ready(
                Box::new(replay.clone()) as Box<dyn Captioner>,
            ),
            BackendKind::Tract => return Err(anyhow!("no tract captioner is available")),
        };
        let detector = match settings.detection {
            BackendKind::Stub => {
                ModelSlot::ready(Box::new(StubBackend::new()) as Box<dyn ObjectDetector>)
            }
            BackendKind::Replay => ModelSlot::ready(
                Box::new(replay.clone()) as Box<dyn ObjectDetector>,
            ),
            BackendKind::Tract => tract_detector(settings)?,
        };
        log::info!(
            "stage backends: classification={} caption={} detection={}",
            settings.classification,
            settings.caption,
            settings.detection
        );
        Ok(Self::new(classifier, captioner, detector))
    }

    pub fn classifier(&self) -> &ModelSlot<dyn Classifier> {
        &self.classifier
    }

    pub fn captioner(&self) -> &ModelSlot<dyn Captioner> {
        &self.captioner
    }

    pub fn detector(&self) -> &ModelSlot<dyn ObjectDetector> {
        &self.detector
    }

    /// Load every model and run each backend's warm-up hook.
    pub fn warm_up(&self) -> Result<(), PipelineError> {
        for stage in StageKind::ALL {
            let outcome = match stage {
                StageKind::Classification => self.classifier.with(|backend| {
                    log::debug!("warming up {} classifier", backend.name());
                    backend.warm_up()
                }),
                StageKind::Caption => self.captioner.with(|backend| {
                    log::debug!("warming up {} captioner", backend.name());
                    backend.warm_up()
                }),
                StageKind::Detection => self.detector.with(|backend| {
                    log::debug!("warming up {} detector", backend.name());
                    backend.warm_up()
                }),
            };
            outcome.map_err(|err| PipelineError::stage(stage, err))?;
        }
        Ok(())
    }
}

#[cfg(feature = "backend-tract")]
fn tract_classifier(settings: &BackendSettings) -> Result<ModelSlot<dyn Classifier>> {
    use super::backends::TractClassifier;

    let path = settings
        .classifier_model
        .clone()
        .ok_or_else(|| anyhow!("tract classification requires backends.classifier_model"))?;
    let input_size = settings.input_size;
    Ok(ModelSlot::lazy(move || {
        log::info!("loading classifier model {}", path.display());
        Ok(Box::new(TractClassifier::load(&path, input_size)?) as Box<dyn Classifier>)
    }))
}

#[cfg(feature = "backend-tract")]
fn tract_detector(settings: &BackendSettings) -> Result<ModelSlot<dyn ObjectDetector>> {
    use super::backends::TractDetector;

    let (model, labels) = match (&settings.detector_model, &settings.detector_labels) {
        (Some(model), Some(labels)) => (model.clone(), labels.clone()),
        _ => {
            return Err(anyhow!(
                "tract detection requires backends.detector_model and backends.detector_labels"
            ))
        }
    };
    let input_size = settings.input_size;
    Ok(ModelSlot::lazy(move || {
        log::info!("loading detector model {}", model.display());
        Ok(Box::new(TractDetector::load(&model, &labels, input_size)?) as Box<dyn ObjectDetector>)
    }))
}

#[cfg(not(feature = "backend-tract"))]
fn tract_classifier(_settings: &BackendSettings) -> Result<ModelSlot<dyn Classifier>> {
    Err(anyhow!("tract backend requires the backend-tract feature"))
}

#[cfg(not(feature = "backend-tract"))]
fn tract_detector(_settings: &BackendSettings) -> Result<ModelSlot<dyn ObjectDetector>> {
    Err(anyhow!("tract backend requires the backend-tract feature"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_names() {
        assert_eq!("Replay".parse::<BackendKind>().unwrap(), BackendKind::Replay);
        assert_eq!(" stub ".parse::<BackendKind>().unwrap(), BackendKind::Stub);
        assert!("yolo".parse::<BackendKind>().is_err());
    }

    #[test]
    fn tract_captioning_is_rejected() {
        let mut settings = BackendSettings::all(BackendKind::Stub);
        settings.caption = BackendKind::Tract;
        assert!(settings.validate().is_err());
        assert!(StageSet::from_settings(&settings).is_err());
    }

    #[test]
    fn tract_detection_needs_model_files() {
        let mut settings = BackendSettings::all(BackendKind::Stub);
        settings.detection = BackendKind::Tract;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("detector_model"));
    }

    #[test]
    fn stub_set_warms_up() {
        let stages = StageSet::from_settings(&BackendSettings::all(BackendKind::Stub)).unwrap();
        stages.warm_up().unwrap();
        assert!(stages.classifier().is_loaded());
        assert!(stages.detector().is_loaded());
    }
}
