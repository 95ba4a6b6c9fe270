use serde::{Deserialize, Serialize};

use crate::geometry::AxisAlignedRect;

/// One labeled box as produced by a detector backend.
///
/// Only lives for the duration of one pipeline invocation; the pipeline
/// filters it by confidence and classifies it before anything else sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Label in the detector's own vocabulary.
    #[serde(rename = "label")]
    pub native_label: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// Box in frame pixel space.
    pub bbox: AxisAlignedRect,
}

impl RawDetection {
    pub fn new(native_label: impl Into<String>, confidence: f32, bbox: AxisAlignedRect) -> Self {
        Self {
            native_label: native_label.into(),
            confidence,
            bbox,
        }
    }

    /// Finite confidence in `[0, 1]` and a well-formed box.
    pub fn is_well_formed(&self) -> bool {
        self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
            && self.bbox.is_well_formed()
    }
}
