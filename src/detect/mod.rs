mod result;
mod summary;

pub use result::{BoundingBox, Confidence, DetectedObject, DetectionOutput, DetectionParams};
pub use summary::{confident_objects, summarize, DetectionSummary, MIN_CONFIDENCE};
