//! Blockage assessment.
//!
//! Every exit marker is tested against every obstruction (full cross product,
//! no early exit). Flags are monotonic within one assessment: once a marker is
//! blocked or an obstruction is blocking, it stays that way.

use serde::Serialize;

use crate::classify::DomainClass;
use crate::detect::RawDetection;
use crate::geometry::{overlaps_with_ratio, DEFAULT_OVERLAP_RATIO};

/// A raw detection that mapped onto a domain class.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassifiedDetection {
    pub detection: RawDetection,
    pub domain_class: DomainClass,
    is_blocked: bool,
    is_blocking: bool,
}

impl ClassifiedDetection {
    pub fn new(detection: RawDetection, domain_class: DomainClass) -> Self {
        Self {
            detection,
            domain_class,
            is_blocked: false,
            is_blocking: false,
        }
    }

    /// Only meaningful for exit markers.
    pub fn is_blocked(&self) -> bool {
        self.is_blocked
    }

    /// Only meaningful for obstructions.
    pub fn is_blocking(&self) -> bool {
        self.is_blocking
    }

    pub fn is_exit_marker(&self) -> bool {
        self.domain_class == DomainClass::ExitMarker
    }

    pub fn is_obstruction(&self) -> bool {
        self.domain_class == DomainClass::Obstruction
    }
}

/// Result of one pipeline invocation. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssessmentResult {
    detections: Vec<ClassifiedDetection>,
    exit_blocked: bool,
}

impl AssessmentResult {
    /// Classified detections in detector order.
    pub fn detections(&self) -> &[ClassifiedDetection] {
        &self.detections
    }

    /// True iff at least one exit marker is blocked.
    pub fn exit_blocked(&self) -> bool {
        self.exit_blocked
    }

    pub fn exit_markers(&self) -> impl Iterator<Item = &ClassifiedDetection> {
        self.detections.iter().filter(|d| d.is_exit_marker())
    }

    pub fn obstructions(&self) -> impl Iterator<Item = &ClassifiedDetection> {
        self.detections.iter().filter(|d| d.is_obstruction())
    }

    pub fn blocked_marker_count(&self) -> usize {
        self.exit_markers().filter(|d| d.is_blocked()).count()
    }
}

pub struct BlockageAssessor;

impl BlockageAssessor {
    pub fn assess(detections: Vec<ClassifiedDetection>) -> AssessmentResult {
        Self::assess_with_ratio(detections, DEFAULT_OVERLAP_RATIO)
    }

    pub fn assess_with_ratio(
        mut detections: Vec<ClassifiedDetection>,
        overlap_ratio: f32,
    ) -> AssessmentResult {
        let markers: Vec<usize> = indices_of(&detections, DomainClass::ExitMarker);
        let obstructions: Vec<usize> = indices_of(&detections, DomainClass::Obstruction);

        if markers.is_empty() || obstructions.is_empty() {
            return AssessmentResult {
                detections,
                exit_blocked: false,
            };
        }

        for &m in &markers {
            for &o in &obstructions {
                let marker_box = detections[m].detection.bbox;
                let obstruction_box = detections[o].detection.bbox;
                if overlaps_with_ratio(&marker_box, &obstruction_box, overlap_ratio) {
                    detections[m].is_blocked = true;
                    detections[o].is_blocking = true;
                }
            }
        }

        let exit_blocked = markers.iter().any(|&m| detections[m].is_blocked);
        AssessmentResult {
            detections,
            exit_blocked,
        }
    }
}

fn indices_of(detections: &[ClassifiedDetection], class: DomainClass) -> Vec<usize> {
    detections
        .iter()
        .enumerate()
        .filter(|(_, d)| d.domain_class == class)
        .map(|(i, _)| i)
        .collect()
}
