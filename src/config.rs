use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::anomaly::KnownCases;
use crate::detect::{DetectionParams, MIN_CONFIDENCE};
use crate::pipeline::{PipelineSettings, DEFAULT_LABELS};
use crate::stage::{BackendKind, BackendSettings};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;
const DEFAULT_CONF_THRESHOLD: f32 = 0.4;
const DEFAULT_IOU_THRESHOLD: f32 = 0.6;

#[derive(Debug, Deserialize, Default)]
struct NavalConfigFile {
    api: Option<ApiConfigFile>,
    classification: Option<ClassificationConfigFile>,
    detection: Option<DetectionConfigFile>,
    anomaly: Option<AnomalyConfigFile>,
    backends: Option<BackendsConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassificationConfigFile {
    labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    conf_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    min_confidence: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct AnomalyConfigFile {
    known_cases: Option<BTreeMap<String, u32>>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendsConfigFile {
    classification: Option<String>,
    caption: Option<String>,
    detection: Option<String>,
    replay_dir: Option<PathBuf>,
    classifier_model: Option<PathBuf>,
    detector_model: Option<PathBuf>,
    detector_labels: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    parallel_stages: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NavalConfig {
    pub api_addr: String,
    pub max_upload_bytes: usize,
    pub labels: Vec<String>,
    pub detection: DetectionParams,
    /// Percent.
    pub min_confidence: f64,
    pub known_cases: KnownCases,
    pub backends: BackendSettings,
    pub parallel_stages: bool,
}

impl Default for NavalConfig {
    fn default() -> Self {
        // An empty file cannot fail to parse any option.
        Self::from_file(NavalConfigFile::default()).unwrap_or_else(|_| unreachable!())
    }
}

impl NavalConfig {
    /// Read `NAVAL_CONFIG` (JSON, or TOML by extension), apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("NAVAL_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            labels: self.labels.clone(),
            detection: self.detection,
            min_confidence: self.min_confidence,
            parallel_stages: self.parallel_stages,
        }
    }

    fn from_file(file: NavalConfigFile) -> Result<Self> {
        let api_addr = file
            .api
            .as_ref()
            .and_then(|api| api.addr.clone())
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let max_upload_bytes = file
            .api
            .as_ref()
            .and_then(|api| api.max_upload_bytes)
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        let labels = file
            .classification
            .and_then(|classification| classification.labels)
            .unwrap_or_else(|| DEFAULT_LABELS.iter().map(|s| s.to_string()).collect());
        let detection = DetectionParams {
            conf_threshold: file
                .detection
                .as_ref()
                .and_then(|detection| detection.conf_threshold)
                .unwrap_or(DEFAULT_CONF_THRESHOLD),
            iou_threshold: file
                .detection
                .as_ref()
                .and_then(|detection| detection.iou_threshold)
                .unwrap_or(DEFAULT_IOU_THRESHOLD),
        };
        let min_confidence = file
            .detection
            .as_ref()
            .and_then(|detection| detection.min_confidence)
            .unwrap_or(MIN_CONFIDENCE);
        let known_cases = file
            .anomaly
            .and_then(|anomaly| anomaly.known_cases)
            .unwrap_or_default()
            .into_iter()
            .collect();

        let backends_file = file.backends.unwrap_or_default();
        let mut backends = BackendSettings::default();
        if let Some(kind) = backends_file.classification {
            backends.classification = kind.parse()?;
        }
        if let Some(kind) = backends_file.caption {
            backends.caption = kind.parse()?;
        }
        if let Some(kind) = backends_file.detection {
            backends.detection = kind.parse()?;
        }
        if let Some(dir) = backends_file.replay_dir {
            backends.replay_dir = dir;
        }
        backends.classifier_model = backends_file.classifier_model;
        backends.detector_model = backends_file.detector_model;
        backends.detector_labels = backends_file.detector_labels;
        if let Some(size) = backends_file.input_size {
            backends.input_size = size;
        }

        let parallel_stages = file
            .pipeline
            .and_then(|pipeline| pipeline.parallel_stages)
            .unwrap_or(true);

        Ok(Self {
            api_addr,
            max_upload_bytes,
            labels,
            detection,
            min_confidence,
            known_cases,
            backends,
            parallel_stages,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("NAVAL_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(value) = std::env::var("NAVAL_MIN_CONFIDENCE") {
            self.min_confidence = parse_env_number("NAVAL_MIN_CONFIDENCE", &value)?;
        }
        if let Ok(value) = std::env::var("NAVAL_CONF_THRESHOLD") {
            self.detection.conf_threshold = parse_env_number("NAVAL_CONF_THRESHOLD", &value)?;
        }
        if let Ok(value) = std::env::var("NAVAL_IOU_THRESHOLD") {
            self.detection.iou_threshold = parse_env_number("NAVAL_IOU_THRESHOLD", &value)?;
        }
        if let Ok(backend) = std::env::var("NAVAL_BACKEND") {
            if !backend.trim().is_empty() {
                let kind: BackendKind = backend.parse()?;
                self.backends.classification = kind;
                self.backends.caption = kind;
                self.backends.detection = kind;
            }
        }
        if let Ok(dir) = std::env::var("NAVAL_REPLAY_DIR") {
            if !dir.trim().is_empty() {
                self.backends.replay_dir = PathBuf::from(dir);
            }
        }
        if let Ok(cases) = std::env::var("NAVAL_KNOWN_CASES") {
            let parsed = parse_known_cases(&cases)?;
            if !parsed.is_empty() {
                self.known_cases = parsed;
            }
        }
        if let Ok(value) = std::env::var("NAVAL_PARALLEL_STAGES") {
            self.parallel_stages = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(anyhow!("NAVAL_PARALLEL_STAGES must be true or false")),
            };
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if !self.min_confidence.is_finite() || !(0.0..=100.0).contains(&self.min_confidence) {
            return Err(anyhow!("min_confidence must be a percentage in [0, 100]"));
        }
        for (name, value) in [
            ("conf_threshold", self.detection.conf_threshold),
            ("iou_threshold", self.detection.iou_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(anyhow!("{} must be in (0, 1]", name));
            }
        }
        self.labels = self
            .labels
            .iter()
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .collect();
        if self.labels.is_empty() {
            return Err(anyhow!("at least one classification label is required"));
        }
        if self.known_cases.iter().any(|(fragment, _)| fragment.is_empty()) {
            return Err(anyhow!("known case identifiers must not be empty"));
        }
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        self.backends.validate()?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<NavalConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_env_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be a number", key))
}

/// `a.jpg=2,b.jpg=3`
fn parse_known_cases(value: &str) -> Result<KnownCases> {
    let mut cases = KnownCases::new();
    for entry in split_csv(value) {
        let (fragment, expected) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("NAVAL_KNOWN_CASES entry '{}' must be name=count", entry))?;
        let expected: u32 = expected
            .trim()
            .parse()
            .map_err(|_| anyhow!("NAVAL_KNOWN_CASES count for '{}' must be an integer", fragment))?;
        cases.insert(fragment, expected);
    }
    Ok(cases)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
