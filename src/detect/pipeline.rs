use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use tokio::sync::OnceCell;

use crate::assess::{AssessmentResult, BlockageAssessor, ClassifiedDetection};
use crate::classify::ClassMapper;
use crate::detect::backend::{DetectorBackend, DetectorLoader};
use crate::detect::result::RawDetection;
use crate::error::ScanError;
use crate::frame::Frame;
use crate::geometry::DEFAULT_OVERLAP_RATIO;

/// Detections below this confidence never reach classification.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    /// Minimum confidence (inclusive) for a raw detection to be classified.
    /// A detection at exactly the threshold is kept (`>=`, not `>`).
    pub confidence: f32,
    /// Minimum covered fraction of the smaller box for a blocking overlap.
    pub overlap_ratio: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE_THRESHOLD,
            overlap_ratio: DEFAULT_OVERLAP_RATIO,
        }
    }
}

type SharedBackend = Arc<Mutex<Box<dyn DetectorBackend>>>;

/// Frame in, assessment out.
///
/// Owns the detector capability. The backend is loaded lazily on first use;
/// concurrent callers during loading wait on the same in-flight load, and a
/// failed load is not cached, so the next call tries again. Once loaded the
/// backend is shared by every caller for the lifetime of the pipeline.
pub struct DetectionPipeline {
    loader: Arc<dyn DetectorLoader>,
    backend: OnceCell<SharedBackend>,
    thresholds: Thresholds,
}

impl DetectionPipeline {
    pub fn new(loader: Arc<dyn DetectorLoader>) -> Self {
        Self {
            loader,
            backend: OnceCell::new(),
            thresholds: Thresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// True once a load has succeeded.
    pub fn is_loaded(&self) -> bool {
        self.backend.initialized()
    }

    /// Run the full pipeline on one frame.
    ///
    /// On error no partial result is returned: the assessment did not happen.
    pub async fn detect(&self, frame: Arc<Frame>) -> Result<AssessmentResult, ScanError> {
        let backend = self.backend().await?;

        let raw = tokio::task::spawn_blocking(move || {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            let view = frame.view();
            guard.infer(&view)
        })
        .await
        .map_err(|e| ScanError::DetectionFailed(format!("inference task aborted: {}", e)))?
        .map_err(|e| {
            log::warn!("inference failed: {:#}", e);
            ScanError::DetectionFailed(format!("{:#}", e))
        })?;

        Ok(self.assess_raw(raw))
    }

    /// Confidence filter, classification, then blockage assessment.
    pub fn assess_raw(&self, raw: Vec<RawDetection>) -> AssessmentResult {
        let total = raw.len();
        let classified: Vec<ClassifiedDetection> = raw
            .into_iter()
            .filter(|d| {
                if !d.is_well_formed() {
                    log::debug!("dropping malformed detection {:?}", d);
                    return false;
                }
                d.confidence >= self.thresholds.confidence
            })
            .filter_map(|d| {
                let class = ClassMapper::map(&d.native_label).domain()?;
                Some(ClassifiedDetection::new(d, class))
            })
            .collect();

        let result = BlockageAssessor::assess_with_ratio(classified, self.thresholds.overlap_ratio);
        log::debug!(
            "assessment: {} raw, {} classified, {} markers blocked, exit_blocked={}",
            total,
            result.detections().len(),
            result.blocked_marker_count(),
            result.exit_blocked()
        );
        result
    }

    async fn backend(&self) -> Result<SharedBackend, ScanError> {
        let backend = self
            .backend
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.loader);
                log::info!("loading detector via {} loader", loader.name());
                let backend = tokio::task::spawn_blocking(move || {
                    let mut backend = loader.load()?;
                    backend.warm_up().context("detector warm-up")?;
                    Ok::<_, anyhow::Error>(backend)
                })
                .await
                .map_err(|e| {
                    ScanError::ModelUnavailable(format!("detector load task aborted: {}", e))
                })?
                .map_err(|e| {
                    log::error!("detector load failed: {:#}", e);
                    ScanError::ModelUnavailable(format!("{:#}", e))
                })?;
                log::info!("detector {} ready", backend.name());
                Ok::<_, ScanError>(Arc::new(Mutex::new(backend)))
            })
            .await?;
        Ok(Arc::clone(backend))
    }
}
