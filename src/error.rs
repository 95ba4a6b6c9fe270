use thiserror::Error;

/// Failure kinds surfaced by the detection pipeline and its collaborators.
///
/// Collaborator traits report `anyhow` errors; they are mapped onto one of
/// these kinds at the boundary so callers can apply a per-kind policy.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    /// The detector could not be initialised. Retried on the next call.
    #[error("detection model unavailable: {0}")]
    ModelUnavailable(String),

    /// Inference failed on an initialised detector.
    #[error("detection failed: {0}")]
    DetectionFailed(String),

    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("notification failed: {0}")]
    NotificationFailed(String),
}

impl ScanError {
    /// Pipeline failures are retryable; the session returns to live preview.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanError::ModelUnavailable(_) | ScanError::DetectionFailed(_)
        )
    }

    pub(crate) fn store(err: anyhow::Error) -> Self {
        ScanError::StoreUnavailable(format!("{:#}", err))
    }

    pub(crate) fn notification(err: anyhow::Error) -> Self {
        ScanError::NotificationFailed(format!("{:#}", err))
    }
}
