//! Black-box inference stages.
//!
//! Each stage is a trait with a request/response contract over one decoded
//! image. Backends live in [`ModelSlot`]s owned by a [`StageSet`], which the
//! pipeline receives at construction.

mod backend;
pub mod backends;
mod registry;
mod slot;

pub use backend::{
    count_in_caption, Caption, Captioner, Classification, Classifier, ObjectDetector, StageKind,
};
pub use backends::{ReplayBackend, StubBackend};
pub use registry::{BackendKind, BackendSettings, StageSet};
pub use slot::ModelSlot;
