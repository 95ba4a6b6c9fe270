//! Axis-aligned boxes in frame pixel space and the overlap test used to
//! decide whether an obstruction covers an exit marker.
//!
//! Overlap is measured against the SMALLER of the two boxes rather than as
//! intersection-over-union: a large obstruction covering most of a small
//! exit sign must register even though the covered area is a small fraction
//! of the obstruction itself.

use serde::{Deserialize, Serialize};

/// Minimum fraction of the smaller box that must be covered.
pub const DEFAULT_OVERLAP_RATIO: f32 = 0.2;

/// Box in the coordinate space of the captured frame (pixels, origin top-left).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisAlignedRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl AxisAlignedRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True when every coordinate is finite and both dimensions are non-negative.
    pub fn is_well_formed(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width >= 0.0
            && self.height >= 0.0
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection of two boxes, or `None` when either intersection
    /// dimension is non-positive (disjoint or merely touching).
    pub fn intersection(&self, other: &AxisAlignedRect) -> Option<AxisAlignedRect> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let width = self.right().min(other.right()) - left;
        let height = self.bottom().min(other.bottom()) - top;
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(AxisAlignedRect::new(left, top, width, height))
    }
}

/// Significant overlap at the default ratio.
pub fn overlaps(a: &AxisAlignedRect, b: &AxisAlignedRect) -> bool {
    overlaps_with_ratio(a, b, DEFAULT_OVERLAP_RATIO)
}

/// Returns true when the intersection covers at least `ratio` of the smaller
/// box's area. Zero-area inputs never overlap.
pub fn overlaps_with_ratio(a: &AxisAlignedRect, b: &AxisAlignedRect, ratio: f32) -> bool {
    let Some(intersection) = a.intersection(b) else {
        return false;
    };
    let smaller_area = a.area().min(b.area());
    if smaller_area <= 0.0 {
        return false;
    }
    intersection.area() / smaller_area >= ratio
}
