use anyhow::Result;

use crate::detect::result::RawDetection;
use crate::frame::FrameView;

/// Detector backend trait.
///
/// Backends are opaque capabilities: given a frame they return labeled boxes
/// with confidence, in their own label vocabulary. Filtering and
/// classification happen in the pipeline, never in the backend.
///
/// Implementations must treat the pixel slice as read-only and must not keep
/// it past the `infer` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on a frame. May be slow; the pipeline calls this on the
    /// blocking pool.
    fn infer(&mut self, frame: &FrameView<'_>) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, run once right after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Produces a ready-to-use backend. Loading may be slow and may fail; the
/// pipeline invokes it lazily and at most once per successful load.
pub trait DetectorLoader: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> Result<Box<dyn DetectorBackend>>;
}
