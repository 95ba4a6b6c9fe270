//! Scan workflow state machine.
//!
//! ```text
//! Idle -> AwaitingPermission -> Live -> Capturing -> Assessing
//!      -> AwaitingUserVerdict -> Resolving -> Idle
//!                 \-> PermissionDenied (until retried)
//! ```
//!
//! Any phase returns to `Idle` on `cancel()`.
//!
//! No lock is held across a suspension point (permission request, capture,
//! pipeline call, store or sink call). The session carries a generation
//! number; `cancel()` bumps it synchronously, and an outcome that arrives for
//! an older generation is discarded instead of being applied.
//!
//! The machine never resolves on its own: a finished assessment always waits
//! for a human verdict, with `exit_blocked` offered only as a suggestion.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use serde::Serialize;
use thiserror::Error;

use crate::assess::AssessmentResult;
use crate::camera::{Access, Camera};
use crate::detect::DetectionPipeline;
use crate::error::ScanError;
use crate::frame::Frame;
use crate::notify::{Delivery, Notice, NotificationSink};
use crate::storage::{
    NewNotification, NewScan, NotificationRecord, NotificationStatus, RecordStore, ScanRecord,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Idle,
    AwaitingPermission,
    PermissionDenied,
    Live,
    Capturing,
    Assessing,
    AwaitingUserVerdict,
    Resolving,
}

/// Human-confirmed outcome of a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Blocked,
    Clear,
}

impl Verdict {
    pub fn is_blocked(self) -> bool {
        self == Verdict::Blocked
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("cannot {action} while {phase:?}")]
    InvalidTransition {
        phase: WorkflowPhase,
        action: &'static str,
    },

    /// The session was cancelled or restarted while this call was suspended.
    #[error("session was cancelled before the outcome arrived; outcome discarded")]
    Superseded,

    /// The camera did not yield a frame. The session is back in `Live`.
    #[error("camera capture failed: {0}")]
    CaptureFailed(String),

    /// The pipeline did not produce an assessment. The session is back in `Live`.
    #[error("assessment did not complete: {0}")]
    Assessment(ScanError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NotificationOutcome {
    /// Verdict was `Clear`.
    NotRequested,
    /// Settings absent, notifications disabled, or no recipient configured.
    Skipped(String),
    /// Settings could not be read; no notification was attempted.
    Unavailable(ScanError),
    Attempted {
        status: NotificationStatus,
        /// Set when the sink failed or did not deliver.
        error: Option<ScanError>,
        /// The notification record write, independent of delivery.
        record: Result<NotificationRecord, ScanError>,
    },
}

impl NotificationOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            NotificationOutcome::Attempted {
                status: NotificationStatus::Sent,
                ..
            }
        )
    }

    pub fn errors(&self) -> Vec<&ScanError> {
        match self {
            NotificationOutcome::NotRequested | NotificationOutcome::Skipped(_) => Vec::new(),
            NotificationOutcome::Unavailable(e) => vec![e],
            NotificationOutcome::Attempted { error, record, .. } => {
                error.iter().chain(record.as_ref().err()).collect()
            }
        }
    }
}

/// Report of a completed cycle. The session is `Idle` once this is returned.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub verdict: Verdict,
    pub scan: Result<ScanRecord, ScanError>,
    pub notification: NotificationOutcome,
}

impl Resolution {
    /// True when any side effect failed. The verdict itself still stands.
    pub fn is_degraded(&self) -> bool {
        self.scan.is_err() || !self.notification.errors().is_empty()
    }
}

#[derive(Debug)]
struct ScanSession {
    phase: WorkflowPhase,
    last_frame: Option<Arc<Frame>>,
    last_result: Option<AssessmentResult>,
    generation: u64,
}

impl ScanSession {
    fn new() -> Self {
        Self {
            phase: WorkflowPhase::Idle,
            last_frame: None,
            last_result: None,
            generation: 0,
        }
    }

    fn expect(&self, allowed: &[WorkflowPhase], action: &'static str) -> Result<(), WorkflowError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidTransition {
                phase: self.phase,
                action,
            })
        }
    }

    /// Back to `Idle`, discarding the frame and result. Outstanding calls
    /// from the previous generation will be discarded when they return.
    fn supersede(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.phase = WorkflowPhase::Idle;
        self.last_frame = None;
        self.last_result = None;
    }
}

pub struct ScanWorkflow {
    camera: Arc<dyn Camera>,
    pipeline: Arc<DetectionPipeline>,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn NotificationSink>,
    session: Mutex<ScanSession>,
}

impl ScanWorkflow {
    pub fn new(
        camera: Arc<dyn Camera>,
        pipeline: Arc<DetectionPipeline>,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            camera,
            pipeline,
            store,
            sink,
            session: Mutex::new(ScanSession::new()),
        }
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.session().phase
    }

    /// Assessment awaiting a verdict, if any.
    pub fn last_result(&self) -> Option<AssessmentResult> {
        self.session().last_result.clone()
    }

    /// Pre-filled suggestion for the verdict prompt. Never applied automatically.
    pub fn suggested_verdict(&self) -> Option<Verdict> {
        self.session().last_result.as_ref().map(|result| {
            if result.exit_blocked() {
                Verdict::Blocked
            } else {
                Verdict::Clear
            }
        })
    }

    /// `Idle -> AwaitingPermission -> Live | PermissionDenied`.
    pub async fn start(&self) -> Result<WorkflowPhase, WorkflowError> {
        let generation = {
            let mut session = self.session();
            session.expect(&[WorkflowPhase::Idle], "start a session")?;
            session.supersede();
            session.phase = WorkflowPhase::AwaitingPermission;
            session.generation
        };
        self.request_permission(generation).await
    }

    /// `PermissionDenied -> AwaitingPermission -> Live | PermissionDenied`.
    pub async fn retry_permission(&self) -> Result<WorkflowPhase, WorkflowError> {
        let generation = {
            let mut session = self.session();
            session.expect(&[WorkflowPhase::PermissionDenied], "retry camera permission")?;
            session.phase = WorkflowPhase::AwaitingPermission;
            session.generation
        };
        self.request_permission(generation).await
    }

    /// `Live -> Capturing -> Assessing -> AwaitingUserVerdict`.
    ///
    /// On capture or pipeline failure the session returns to `Live`.
    pub async fn capture(&self) -> Result<AssessmentResult, WorkflowError> {
        let generation = {
            let mut session = self.session();
            session.expect(&[WorkflowPhase::Live], "capture a frame")?;
            session.phase = WorkflowPhase::Capturing;
            session.generation
        };

        let camera = Arc::clone(&self.camera);
        let frame = match run_blocking(move || camera.capture()).await {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                log::warn!("capture failed: {:#}", e);
                self.commit(generation, |s| s.phase = WorkflowPhase::Live)?;
                return Err(WorkflowError::CaptureFailed(format!("{:#}", e)));
            }
        };

        self.commit(generation, |s| {
            s.last_frame = Some(Arc::clone(&frame));
            s.last_result = None;
            s.phase = WorkflowPhase::Assessing;
        })?;

        match self.pipeline.detect(frame).await {
            Ok(result) => {
                let applied = self.commit(generation, |s| {
                    s.last_result = Some(result.clone());
                    s.phase = WorkflowPhase::AwaitingUserVerdict;
                });
                if applied.is_err() {
                    log::warn!(
                        "discarding late assessment (exit_blocked={}) for cancelled session",
                        result.exit_blocked()
                    );
                }
                applied?;
                log::info!(
                    "assessment ready: {} detections, suggested verdict {}",
                    result.detections().len(),
                    if result.exit_blocked() { "blocked" } else { "clear" }
                );
                Ok(result)
            }
            Err(e) => {
                log::warn!("assessment failed, returning to live preview: {}", e);
                self.commit(generation, |s| {
                    s.last_frame = None;
                    s.phase = WorkflowPhase::Live;
                })?;
                Err(WorkflowError::Assessment(e))
            }
        }
    }

    /// `AwaitingUserVerdict -> Resolving -> Idle`.
    ///
    /// The scan record and the notification are independent side effects; a
    /// failure in either is reported in the `Resolution` and logged, and the
    /// session returns to `Idle` regardless.
    pub async fn confirm(&self, verdict: Verdict) -> Result<Resolution, WorkflowError> {
        let (generation, frame) = {
            let mut session = self.session();
            session.expect(&[WorkflowPhase::AwaitingUserVerdict], "confirm a verdict")?;
            let Some(frame) = session.last_frame.clone() else {
                return Err(WorkflowError::InvalidTransition {
                    phase: session.phase,
                    action: "confirm a verdict without a captured frame",
                });
            };
            session.phase = WorkflowPhase::Resolving;
            (session.generation, frame)
        };

        let image_ref = frame.image_ref();
        let timestamp_s = crate::now_s().unwrap_or_else(|_| frame.captured_at_s());
        drop(frame);

        let scan = self
            .append_scan(NewScan {
                timestamp_s,
                blocked: verdict.is_blocked(),
                image_ref: image_ref.clone(),
            })
            .await;

        let notification = match verdict {
            Verdict::Blocked => self.dispatch_notification(&image_ref, timestamp_s).await,
            Verdict::Clear => NotificationOutcome::NotRequested,
        };

        match self.commit(generation, |s| s.supersede()) {
            Ok(()) => self.camera.release(),
            Err(_) => log::warn!("session cancelled during resolution; records already written"),
        }

        let resolution = Resolution {
            verdict,
            scan,
            notification,
        };
        if resolution.is_degraded() {
            log::warn!("scan resolved as {:?} with degraded side effects", verdict);
        } else {
            log::info!("scan resolved as {:?}", verdict);
        }
        Ok(resolution)
    }

    /// Return to `Idle` immediately. Valid in every phase.
    ///
    /// Returns the phase that was abandoned.
    pub fn cancel(&self) -> WorkflowPhase {
        let previous = {
            let mut session = self.session();
            let previous = session.phase;
            session.supersede();
            previous
        };
        if previous != WorkflowPhase::Idle {
            log::info!("scan session cancelled during {:?}", previous);
            self.camera.release();
        }
        previous
    }

    fn session(&self) -> MutexGuard<'_, ScanSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` only while the session is still on `generation`.
    fn commit<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut ScanSession) -> R,
    ) -> Result<R, WorkflowError> {
        let mut session = self.session();
        if session.generation != generation {
            return Err(WorkflowError::Superseded);
        }
        Ok(f(&mut session))
    }

    async fn request_permission(&self, generation: u64) -> Result<WorkflowPhase, WorkflowError> {
        let camera = Arc::clone(&self.camera);
        let next = match run_blocking(move || camera.request_access()).await {
            Ok(Access::Granted) => WorkflowPhase::Live,
            Ok(Access::Denied) => {
                log::warn!("camera access refused");
                WorkflowPhase::PermissionDenied
            }
            Err(e) => {
                log::warn!("camera access failed: {:#}", e);
                WorkflowPhase::PermissionDenied
            }
        };
        if let Err(e) = self.commit(generation, |s| s.phase = next) {
            log::warn!("discarding permission outcome {:?} for cancelled session", next);
            return Err(e);
        }
        Ok(next)
    }

    async fn append_scan(&self, scan: NewScan) -> Result<ScanRecord, ScanError> {
        let store = Arc::clone(&self.store);
        let result = run_blocking(move || store.append_scan(scan))
            .await
            .map_err(ScanError::store);
        if let Err(e) = &result {
            log::error!("scan record not saved: {}", e);
        }
        result
    }

    async fn dispatch_notification(&self, image_ref: &str, timestamp_s: u64) -> NotificationOutcome {
        let store = Arc::clone(&self.store);
        let settings = match run_blocking(move || store.settings()).await {
            Ok(Some(settings)) => settings,
            Ok(None) => return skipped("notification settings not configured"),
            Err(e) => {
                let err = ScanError::store(e);
                log::error!("cannot read notification settings: {}", err);
                return NotificationOutcome::Unavailable(err);
            }
        };
        if !settings.notifications_enabled {
            return skipped("notifications disabled");
        }
        let Some(recipient) = settings.recipient().map(str::to_string) else {
            return skipped("no notification recipient configured");
        };

        let notice = Notice::blocked_exit(&recipient, image_ref, timestamp_s);
        let sink = Arc::clone(&self.sink);
        let sink_name = sink.name().to_string();
        let (status, error) = match run_blocking(move || sink.notify(&notice)).await {
            Ok(Delivery { delivered: true }) => (NotificationStatus::Sent, None),
            Ok(Delivery { delivered: false }) => (
                NotificationStatus::Undelivered,
                Some(ScanError::NotificationFailed(format!(
                    "{} sink did not deliver the notice",
                    sink_name
                ))),
            ),
            Err(e) => (NotificationStatus::Failed, Some(ScanError::notification(e))),
        };
        match &error {
            Some(e) => log::error!("notification to {} failed: {}", recipient, e),
            None => log::info!("notification sent to {} via {}", recipient, sink_name),
        }

        let store = Arc::clone(&self.store);
        let record = NewNotification {
            timestamp_s,
            recipient,
            status,
            image_ref: image_ref.to_string(),
        };
        let record = run_blocking(move || store.append_notification(record))
            .await
            .map_err(ScanError::store);
        if let Err(e) = &record {
            log::error!("notification record not saved: {}", e);
        }

        NotificationOutcome::Attempted {
            status,
            error,
            record,
        }
    }
}

fn skipped(reason: &str) -> NotificationOutcome {
    log::warn!("notification skipped: {}", reason);
    NotificationOutcome::Skipped(reason.to_string())
}

/// Run a collaborator call on the blocking pool.
async fn run_blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("blocking task aborted: {}", e))?
}
