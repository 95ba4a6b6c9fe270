//! Exit Witness
//!
//! Checks a camera frame for an emergency exit marker obstructed by a
//! person or object, asks a human to confirm, then records the verdict and
//! notifies the responsible contact when the exit is blocked.
//!
//! # Pipeline
//!
//! Frame -> detector backend -> confidence filter -> class mapping ->
//! blockage assessment -> human verdict -> scan record (+ notification).
//!
//! The assessment is advisory. Only a confirmed verdict is persisted.
//!
//! # Module Structure
//!
//! - `geometry`: axis-aligned boxes and the overlap rule
//! - `classify`: detector vocabulary to domain classes
//! - `assess`: exit-blocked decision over classified detections
//! - `detect`: detector backends and the async detection pipeline
//! - `frame`, `camera`: captured pixels and where they come from
//! - `storage`, `notify`: record store, settings, and notification sinks
//! - `workflow`: the scan session state machine
//! - `config`: runtime configuration (file + env)

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod assess;
pub mod camera;
pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod notify;
pub mod storage;
pub mod workflow;

pub use assess::{AssessmentResult, BlockageAssessor, ClassifiedDetection};
pub use camera::{camera_from_source, Access, Camera, StubCamera};
pub use classify::{ClassMapper, Classification, DomainClass};
pub use detect::{
    DetectionPipeline, DetectorBackend, DetectorLoader, RawDetection, ScriptedBackend,
    ScriptedLoader, Thresholds, DEFAULT_CONFIDENCE_THRESHOLD,
};
pub use error::ScanError;
pub use frame::{Frame, FrameView};
pub use geometry::{overlaps, overlaps_with_ratio, AxisAlignedRect, DEFAULT_OVERLAP_RATIO};
pub use notify::{Delivery, LogSink, Notice, NotificationSink};
pub use storage::{
    InMemoryRecordStore, NotificationRecord, NotificationStatus, RecordStore, ScanRecord,
    Settings, SqliteRecordStore,
};
pub use workflow::{
    NotificationOutcome, Resolution, ScanWorkflow, Verdict, WorkflowError, WorkflowPhase,
};

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
