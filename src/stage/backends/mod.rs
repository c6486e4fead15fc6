pub mod postprocess;
pub mod replay;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use replay::ReplayBackend;
pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::{TractClassifier, TractDetector};
