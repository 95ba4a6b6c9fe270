mod backend;
pub mod backends;
mod pipeline;
mod result;

pub use backend::{DetectorBackend, DetectorLoader};
pub use backends::{ScriptedBackend, ScriptedLoader};
pub use pipeline::{DetectionPipeline, Thresholds, DEFAULT_CONFIDENCE_THRESHOLD};
pub use result::RawDetection;
