use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::detect::{DetectionOutput, DetectionParams};
use crate::image_input::ImageInput;
use crate::stage::backend::{
    count_in_caption, Caption, Captioner, Classification, Classifier, ObjectDetector, StageKind,
};

/// Serves stage replies recorded by an external model runner.
///
/// For an image named `deck.jpg` the replies are read from
/// `<dir>/deck.jpg.json`:
///
/// ```json
/// {
///   "classification": { "label": "destroyer", "confidence": 0.71 },
///   "caption": { "label": "a destroyer at sea", "object_count": null },
///   "detections": { "objects_detected": [
///       { "label": "boat", "confidence": "64.0%", "bbox": [10, 20, 90, 60] }
///   ] }
/// }
/// ```
///
/// Any entry may instead be an error marker, `{ "error": "..." }`, which is
/// reported as a failure of that stage.
///
/// Clones share the last parsed file, so one run reads it once. A stage that
/// asks for the same image again triggers a fresh read.
#[derive(Clone, Debug)]
pub struct ReplayBackend {
    dir: PathBuf,
    last: Arc<Mutex<Option<Recorded>>>,
}

#[derive(Debug)]
struct Recorded {
    path: PathBuf,
    doc: Arc<ReplayDocument>,
    served: Vec<StageKind>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Reply<T> {
    Failed { error: String },
    Ok(T),
}

#[derive(Debug, Deserialize)]
struct ReplayDocument {
    classification: Option<Reply<Classification>>,
    caption: Option<Reply<Caption>>,
    detections: Option<Reply<DetectionOutput>>,
}

impl ReplayBackend {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn reply_path(&self, image_name: &str) -> PathBuf {
        self.dir.join(format!("{image_name}.json"))
    }

    fn load(&self, image: &ImageInput, stage: StageKind) -> Result<Arc<ReplayDocument>> {
        let path = self.reply_path(image.name());
        let mut last = self
            .last
            .lock()
            .map_err(|_| anyhow!("replay cache lock poisoned"))?;
        if let Some(recorded) = last.as_mut() {
            if recorded.path == path && !recorded.served.contains(&stage) {
                recorded.served.push(stage);
                return Ok(Arc::clone(&recorded.doc));
            }
        }
        let doc = Arc::new(read_document(&path)?);
        *last = Some(Recorded {
            path,
            doc: Arc::clone(&doc),
            served: vec![stage],
        });
        Ok(doc)
    }
}

fn read_document(path: &Path) -> Result<ReplayDocument> {
    log::debug!("reading recorded replies from {}", path.display());
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("no recorded replies at {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid replay file {}", path.display()))
}

fn take<T: Clone>(reply: &Option<Reply<T>>, stage: StageKind, image: &ImageInput) -> Result<T> {
    match reply {
        Some(Reply::Ok(value)) => Ok(value.clone()),
        Some(Reply::Failed { error }) => Err(anyhow!("{}", error)),
        None => Err(anyhow!("no {} reply recorded for {}", stage, image.name())),
    }
}

impl Classifier for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn classify(&mut self, image: &ImageInput, _labels: &[String]) -> Result<Classification> {
        let doc = self.load(image, StageKind::Classification)?;
        take(&doc.classification, StageKind::Classification, image)
    }
}

impl Captioner for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn caption(&mut self, image: &ImageInput) -> Result<Caption> {
        let doc = self.load(image, StageKind::Caption)?;
        let mut caption = take(&doc.caption, StageKind::Caption, image)?;
        if caption.object_count.is_none() {
            caption.object_count = count_in_caption(&caption.text);
        }
        Ok(caption)
    }
}

impl ObjectDetector for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(&mut self, image: &ImageInput, _params: DetectionParams) -> Result<DetectionOutput> {
        let doc = self.load(image, StageKind::Detection)?;
        let output = take(&doc.detections, StageKind::Detection, image)?;
        if output.summary.is_empty() && !output.objects_detected.is_empty() {
            return Ok(DetectionOutput::from_objects(output.objects_detected));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    const RECORDED: &str = r#"{
        "classification": { "label": "frigate", "confidence": 0.66 },
        "caption": { "label": "2 boats beside a frigate" },
        "detections": { "objects_detected": [
            { "label": "boat", "confidence": 71.0, "bbox": [0, 0, 10, 10] }
        ] }
    }"#;

    fn image(name: &str) -> ImageInput {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        ImageInput::from_bytes(name, &out.into_inner()).unwrap()
    }

    #[test]
    fn stages_of_one_run_share_a_single_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pier.png.json");
        std::fs::write(&path, RECORDED).unwrap();
        let image = image("pier.png");

        let backend = ReplayBackend::new(dir.path());
        let (mut classifier, mut captioner, mut detector) =
            (backend.clone(), backend.clone(), backend);

        let class = classifier.classify(&image, &[]).unwrap();
        assert_eq!(class.label, "frigate");
        std::fs::remove_file(&path).unwrap();

        let caption = captioner.caption(&image).unwrap();
        assert_eq!(caption.object_count, Some(2));
        let output = detector.detect(&image, DetectionParams::default()).unwrap();
        assert_eq!(output.summary.get("boat"), Some(&1));

        // a second run goes back to disk
        let err = classifier.classify(&image, &[]).unwrap_err();
        assert!(err.to_string().starts_with("no recorded replies at"));
    }

    #[test]
    fn rerecorded_file_is_picked_up_on_the_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pier.png.json");
        std::fs::write(&path, RECORDED).unwrap();
        let image = image("pier.png");
        let mut backend = ReplayBackend::new(dir.path());

        assert_eq!(backend.classify(&image, &[]).unwrap().label, "frigate");
        std::fs::write(
            &path,
            r#"{ "classification": { "label": "destroyer", "confidence": 0.8 } }"#,
        )
        .unwrap();
        assert_eq!(backend.classify(&image, &[]).unwrap().label, "destroyer");
    }
}
