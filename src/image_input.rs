//! Image intake for a single pipeline run.
//!
//! Uploads are checked against an extension allow-list, decoded once with the
//! `image` crate and handed to every stage by reference. Nothing is written to
//! disk.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use serde::Serialize;

use crate::pipeline::PipelineError;

pub const SUPPORTED_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "tiff", "tif", "bmp"];

const RECEIVED_MESSAGE: &str = "Image received and analyzed successfully for naval surveillance.";

/// Name, dimensions and container format of the analyzed image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub filename: String,
    pub size: [u32; 2],
    pub format: String,
    pub message: String,
}

/// A decoded image plus the identifier the rules see.
pub struct ImageInput {
    name: String,
    format: ImageFormat,
    image: DynamicImage,
}

impl ImageInput {
    /// Decode an uploaded image. `filename` is sanitized before use.
    pub fn from_bytes(filename: &str, bytes: &[u8]) -> Result<Self, PipelineError> {
        let name = sanitize_filename(filename)
            .ok_or_else(|| PipelineError::InvalidInput("No selected file".to_string()))?;
        check_extension(&name)?;
        if bytes.is_empty() {
            return Err(PipelineError::InvalidInput(format!("{name} is empty")));
        }

        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PipelineError::InvalidInput(format!("cannot read {name}: {e}")))?;
        let format = reader.format().ok_or_else(|| {
            PipelineError::InvalidInput(format!("{name} is not a recognized image"))
        })?;
        let image = reader
            .decode()
            .map_err(|e| PipelineError::InvalidInput(format!("cannot decode {name}: {e}")))?;

        Ok(Self {
            name,
            format,
            image,
        })
    }

    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path).map_err(|e| {
            PipelineError::InvalidInput(format!("failed to read {}: {}", path.display(), e))
        })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_bytes(&filename, &bytes)
    }

    /// Sanitized file name; the anomaly rules key on this.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn file_info(&self) -> FileInfo {
        let (width, height) = self.dimensions();
        FileInfo {
            filename: self.name.clone(),
            size: [width, height],
            format: format_name(self.format),
            message: RECEIVED_MESSAGE.to_string(),
        }
    }
}

fn check_extension(name: &str) -> Result<(), PipelineError> {
    let ext = Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Ok(());
    }
    let shown = if ext.is_empty() { ext } else { format!(".{ext}") };
    Err(PipelineError::InvalidInput(format!(
        "Format \"{shown}\" not supported. Please upload JPG, PNG, TIFF, or BMP files."
    )))
}

fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "JPEG".to_string(),
        ImageFormat::Png => "PNG".to_string(),
        ImageFormat::Tiff => "TIFF".to_string(),
        ImageFormat::Bmp => "BMP".to_string(),
        other => format!("{other:?}").to_uppercase(),
    }
}

/// Reduce an uploaded file name to a safe basename.
///
/// Directory components are dropped, whitespace becomes `_`, characters
/// outside `[A-Za-z0-9._-]` are removed and leading/trailing `.`/`_` trimmed.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
