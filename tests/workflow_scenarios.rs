use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use exit_witness::storage::{NewNotification, NewScan};
use exit_witness::{
    Access, AxisAlignedRect, Camera, Delivery, Frame, DetectionPipeline, DetectorBackend, DetectorLoader, FrameView,
    InMemoryRecordStore, LogSink, Notice, NotificationOutcome, NotificationRecord,
    NotificationSink, NotificationStatus, RawDetection, RecordStore, ScanError, ScanRecord,
    ScanWorkflow, ScriptedLoader, Settings, StubCamera, Verdict, WorkflowError, WorkflowPhase,
};

fn raw(label: &str, confidence: f32, b: (f32, f32, f32, f32)) -> RawDetection {
    RawDetection::new(label, confidence, AxisAlignedRect::new(b.0, b.1, b.2, b.3))
}

fn blocked_exit() -> Vec<RawDetection> {
    vec![
        raw("exit sign", 0.9, (0.0, 0.0, 100.0, 50.0)),
        raw("person", 0.9, (20.0, 10.0, 60.0, 40.0)),
    ]
}

fn clear_exit() -> Vec<RawDetection> {
    vec![
        raw("exit sign", 0.9, (0.0, 0.0, 100.0, 50.0)),
        raw("person", 0.9, (500.0, 500.0, 60.0, 40.0)),
    ]
}

fn notifying_settings() -> Settings {
    Settings {
        recipient_email: Some("safety@example.com".to_string()),
        recipient_phone: Some("+1 555 0100".to_string()),
        ..Settings::default()
    }
}

/// Sink that remembers every notice it was handed.
#[derive(Default)]
struct RecordingSink {
    notices: Mutex<Vec<Notice>>,
    fail: bool,
    deliver: bool,
}

impl RecordingSink {
    fn delivering() -> Self {
        Self {
            deliver: true,
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn notify(&self, notice: &Notice) -> Result<Delivery> {
        self.notices.lock().unwrap().push(notice.clone());
        if self.fail {
            return Err(anyhow!("smtp relay refused connection"));
        }
        Ok(Delivery {
            delivered: self.deliver,
        })
    }
}

/// In-memory store with switchable write failures.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryRecordStore,
    fail_scans: bool,
    fail_notifications: bool,
    fail_settings: bool,
}

impl RecordStore for FlakyStore {
    fn append_scan(&self, scan: NewScan) -> Result<ScanRecord> {
        if self.fail_scans {
            return Err(anyhow!("database is locked"));
        }
        self.inner.append_scan(scan)
    }

    fn append_notification(&self, notification: NewNotification) -> Result<NotificationRecord> {
        if self.fail_notifications {
            return Err(anyhow!("database is locked"));
        }
        self.inner.append_notification(notification)
    }

    fn latest_scan(&self) -> Result<Option<ScanRecord>> {
        self.inner.latest_scan()
    }

    fn settings(&self) -> Result<Option<Settings>> {
        if self.fail_settings {
            return Err(anyhow!("database is locked"));
        }
        self.inner.settings()
    }

    fn save_settings(&self, settings: Settings) -> Result<Settings> {
        self.inner.save_settings(settings)
    }
}

fn workflow(
    loader: impl DetectorLoader + 'static,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn NotificationSink>,
) -> ScanWorkflow {
    ScanWorkflow::new(
        Arc::new(StubCamera::new("exit_camera", 64, 48)),
        Arc::new(DetectionPipeline::new(Arc::new(loader))),
        store,
        sink,
    )
}

#[tokio::test]
async fn blocked_verdict_records_scan_and_notifies_email_recipient() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.save_settings(notifying_settings()).unwrap();
    let sink = Arc::new(RecordingSink::delivering());
    let wf = workflow(ScriptedLoader::new(blocked_exit()), store.clone(), sink.clone());

    assert_eq!(wf.start().await.unwrap(), WorkflowPhase::Live);
    let result = wf.capture().await.unwrap();
    assert!(result.exit_blocked());
    assert_eq!(wf.phase(), WorkflowPhase::AwaitingUserVerdict);
    assert_eq!(wf.suggested_verdict(), Some(Verdict::Blocked));

    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();
    assert!(!resolution.is_degraded());
    assert!(resolution.notification.is_delivered());
    assert_eq!(wf.phase(), WorkflowPhase::Idle);
    assert!(wf.last_result().is_none());

    let scans = store.scans().unwrap();
    assert_eq!(scans.len(), 1);
    assert!(scans[0].blocked);
    assert!(scans[0].image_ref.starts_with("sha256:"));

    let notices = sink.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].recipient, "safety@example.com");
    assert_eq!(notices[0].image_ref, scans[0].image_ref);

    let notifications = store.notifications().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, NotificationStatus::Sent);
}

#[tokio::test]
async fn human_can_override_the_suggestion() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.save_settings(notifying_settings()).unwrap();
    let sink = Arc::new(RecordingSink::delivering());
    let wf = workflow(ScriptedLoader::new(clear_exit()), store.clone(), sink.clone());

    wf.start().await.unwrap();
    let result = wf.capture().await.unwrap();
    assert!(!result.exit_blocked());
    assert_eq!(wf.suggested_verdict(), Some(Verdict::Clear));

    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();
    assert_eq!(resolution.verdict, Verdict::Blocked);
    assert!(resolution.scan.unwrap().blocked);
    assert_eq!(sink.notices().len(), 1);
}

#[tokio::test]
async fn clear_verdict_sends_nothing() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.save_settings(notifying_settings()).unwrap();
    let sink = Arc::new(RecordingSink::delivering());
    let wf = workflow(ScriptedLoader::new(blocked_exit()), store.clone(), sink.clone());

    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolution = wf.confirm(Verdict::Clear).await.unwrap();

    assert_eq!(resolution.notification, NotificationOutcome::NotRequested);
    assert!(!resolution.scan.unwrap().blocked);
    assert!(sink.notices().is_empty());
    assert!(store.notifications().unwrap().is_empty());
}

#[tokio::test]
async fn low_confidence_obstruction_is_ignored() {
    let store = Arc::new(InMemoryRecordStore::new());
    let wf = workflow(
        ScriptedLoader::new(vec![
            raw("exit sign", 0.9, (0.0, 0.0, 100.0, 50.0)),
            raw("person", 0.3, (20.0, 10.0, 60.0, 40.0)),
        ]),
        store,
        Arc::new(LogSink),
    );

    wf.start().await.unwrap();
    let result = wf.capture().await.unwrap();
    assert!(!result.exit_blocked());
    assert_eq!(result.detections().len(), 1);
    assert_eq!(wf.suggested_verdict(), Some(Verdict::Clear));
}

#[tokio::test]
async fn missing_or_disabled_settings_skip_notification() {
    let sink = Arc::new(RecordingSink::delivering());

    let store = Arc::new(InMemoryRecordStore::new());
    let wf = workflow(ScriptedLoader::new(blocked_exit()), store.clone(), sink.clone());
    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();
    assert!(matches!(resolution.notification, NotificationOutcome::Skipped(_)));
    assert_eq!(store.scans().unwrap().len(), 1);

    store
        .save_settings(Settings {
            notifications_enabled: false,
            ..notifying_settings()
        })
        .unwrap();
    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();
    assert!(matches!(resolution.notification, NotificationOutcome::Skipped(_)));

    store.save_settings(Settings::default()).unwrap();
    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();
    assert!(matches!(resolution.notification, NotificationOutcome::Skipped(_)));

    assert!(sink.notices().is_empty());
    assert!(store.notifications().unwrap().is_empty());
    assert_eq!(store.scans().unwrap().len(), 3);
}

#[tokio::test]
async fn phone_is_used_when_no_email_is_configured() {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .save_settings(Settings {
            recipient_phone: Some("+1 555 0100".to_string()),
            ..Settings::default()
        })
        .unwrap();
    let sink = Arc::new(RecordingSink::delivering());
    let wf = workflow(ScriptedLoader::new(blocked_exit()), store, sink.clone());

    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    wf.confirm(Verdict::Blocked).await.unwrap();
    assert_eq!(sink.notices()[0].recipient, "+1 555 0100");
}

#[tokio::test]
async fn failing_sink_is_recorded_and_session_still_resolves() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.save_settings(notifying_settings()).unwrap();
    let wf = workflow(
        ScriptedLoader::new(blocked_exit()),
        store.clone(),
        Arc::new(RecordingSink::failing()),
    );

    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();

    assert!(resolution.is_degraded());
    assert!(resolution.scan.is_ok());
    match &resolution.notification {
        NotificationOutcome::Attempted { status, error, record } => {
            assert_eq!(*status, NotificationStatus::Failed);
            assert!(matches!(error, Some(ScanError::NotificationFailed(_))));
            assert_eq!(record.as_ref().unwrap().status, NotificationStatus::Failed);
        }
        other => panic!("unexpected notification outcome {:?}", other),
    }
    assert_eq!(wf.phase(), WorkflowPhase::Idle);
}

#[tokio::test]
async fn undelivered_notice_is_reported() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.save_settings(notifying_settings()).unwrap();
    let wf = workflow(
        ScriptedLoader::new(blocked_exit()),
        store.clone(),
        Arc::new(RecordingSink::default()),
    );

    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();
    assert!(resolution.is_degraded());
    assert_eq!(
        store.notifications().unwrap()[0].status,
        NotificationStatus::Undelivered
    );
}

#[tokio::test]
async fn store_failure_is_reported_but_not_fatal() {
    let store = Arc::new(FlakyStore {
        fail_scans: true,
        ..FlakyStore::default()
    });
    store.inner.save_settings(notifying_settings()).unwrap();
    let sink = Arc::new(RecordingSink::delivering());
    let wf = workflow(ScriptedLoader::new(blocked_exit()), store.clone(), sink.clone());

    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();

    assert!(matches!(resolution.scan, Err(ScanError::StoreUnavailable(_))));
    assert!(resolution.notification.is_delivered());
    assert_eq!(sink.notices().len(), 1);
    assert_eq!(wf.phase(), WorkflowPhase::Idle);
}

#[tokio::test]
async fn unreadable_settings_leave_notification_unattempted() {
    let store = Arc::new(FlakyStore {
        fail_settings: true,
        fail_notifications: true,
        ..FlakyStore::default()
    });
    let sink = Arc::new(RecordingSink::delivering());
    let wf = workflow(ScriptedLoader::new(blocked_exit()), store.clone(), sink.clone());

    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolution = wf.confirm(Verdict::Blocked).await.unwrap();

    assert!(matches!(
        resolution.notification,
        NotificationOutcome::Unavailable(ScanError::StoreUnavailable(_))
    ));
    assert!(resolution.scan.is_ok());
    assert!(sink.notices().is_empty());
}

#[tokio::test]
async fn denied_permission_can_be_retried() {
    let wf = ScanWorkflow::new(
        Arc::new(StubCamera::new("exit_camera", 8, 8).denying()),
        Arc::new(DetectionPipeline::new(Arc::new(ScriptedLoader::new(
            Vec::new(),
        )))),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(LogSink),
    );

    assert_eq!(wf.start().await.unwrap(), WorkflowPhase::PermissionDenied);
    assert!(matches!(
        wf.capture().await,
        Err(WorkflowError::InvalidTransition { .. })
    ));
    assert_eq!(
        wf.retry_permission().await.unwrap(),
        WorkflowPhase::PermissionDenied
    );
    assert_eq!(wf.cancel(), WorkflowPhase::PermissionDenied);
    assert_eq!(wf.phase(), WorkflowPhase::Idle);
}

#[tokio::test]
async fn out_of_order_calls_are_rejected() {
    let wf = workflow(
        ScriptedLoader::new(blocked_exit()),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(LogSink),
    );

    assert!(matches!(
        wf.confirm(Verdict::Clear).await,
        Err(WorkflowError::InvalidTransition {
            phase: WorkflowPhase::Idle,
            ..
        })
    ));
    assert!(wf.retry_permission().await.is_err());
    wf.start().await.unwrap();
    assert!(wf.start().await.is_err());
    assert!(wf.confirm(Verdict::Clear).await.is_err());
    assert_eq!(wf.phase(), WorkflowPhase::Live);
}

#[tokio::test]
async fn pipeline_failure_returns_to_live_and_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = dir.path().join("detections.json");
    let wf = workflow(
        ScriptedLoader::from_fixture(&fixture),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(LogSink),
    );

    wf.start().await.unwrap();
    let err = wf.capture().await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Assessment(ScanError::ModelUnavailable(_))
    ));
    assert_eq!(wf.phase(), WorkflowPhase::Live);
    assert!(wf.last_result().is_none());

    std::fs::write(&fixture, serde_json::to_string(&blocked_exit()).unwrap()).unwrap();
    let result = wf.capture().await.unwrap();
    assert!(result.exit_blocked());
    assert_eq!(wf.phase(), WorkflowPhase::AwaitingUserVerdict);
}

#[tokio::test]
async fn cancel_is_idempotent_and_clears_the_session() {
    let wf = workflow(
        ScriptedLoader::new(blocked_exit()),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(LogSink),
    );

    assert_eq!(wf.cancel(), WorkflowPhase::Idle);
    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    assert!(wf.last_result().is_some());

    assert_eq!(wf.cancel(), WorkflowPhase::AwaitingUserVerdict);
    assert_eq!(wf.cancel(), WorkflowPhase::Idle);
    assert!(wf.last_result().is_none());
    assert!(wf.suggested_verdict().is_none());
}

// ----------------------------------------------------------------------------
// Cancellation while inference is in flight
// ----------------------------------------------------------------------------

struct GatedBackend {
    detections: Vec<RawDetection>,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl DetectorBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn infer(&mut self, _frame: &FrameView<'_>) -> Result<Vec<RawDetection>> {
        let _ = self.entered.send(());
        self.release
            .recv()
            .map_err(|_| anyhow!("gate closed without release"))?;
        Ok(self.detections.clone())
    }
}

/// Holds inference until the test releases it.
struct GatedLoader {
    detections: Vec<RawDetection>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl DetectorLoader for GatedLoader {
    fn name(&self) -> &str {
        "gated"
    }

    fn load(&self) -> Result<Box<dyn DetectorBackend>> {
        let (entered, release) = self
            .gate
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("gated backend already loaded"))?;
        Ok(Box::new(GatedBackend {
            detections: self.detections.clone(),
            entered,
            release,
        }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_assessment_after_cancel_is_discarded() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let store = Arc::new(InMemoryRecordStore::new());
    let wf = Arc::new(workflow(
        GatedLoader {
            detections: blocked_exit(),
            gate: Mutex::new(Some((entered_tx, release_rx))),
        },
        store.clone(),
        Arc::new(LogSink),
    ));

    wf.start().await.unwrap();
    let in_flight = {
        let wf = Arc::clone(&wf);
        tokio::spawn(async move { wf.capture().await })
    };

    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wf.phase(), WorkflowPhase::Assessing);

    assert_eq!(wf.cancel(), WorkflowPhase::Assessing);
    assert_eq!(wf.phase(), WorkflowPhase::Idle);

    // A fresh session is already live when the stale result lands.
    assert_eq!(wf.start().await.unwrap(), WorkflowPhase::Live);
    release_tx.send(()).unwrap();

    let outcome = in_flight.await.unwrap();
    assert!(matches!(outcome, Err(WorkflowError::Superseded)));
    assert_eq!(wf.phase(), WorkflowPhase::Live);
    assert!(wf.last_result().is_none());
    assert!(wf.suggested_verdict().is_none());
    assert!(store.scans().unwrap().is_empty());
}

/// One-shot gate: the first caller signals `entered` and blocks until released.
struct Gate {
    ends: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl Gate {
    fn new() -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Self {
            ends: Mutex::new(Some((entered_tx, release_rx))),
        };
        (gate, entered_rx, release_tx)
    }

    fn pass(&self) -> Result<()> {
        let ends = self.ends.lock().unwrap().take();
        if let Some((entered, release)) = ends {
            let _ = entered.send(());
            release
                .recv()
                .map_err(|_| anyhow!("gate closed without release"))?;
        }
        Ok(())
    }
}

async fn wait_entered(entered: Receiver<()>) {
    tokio::task::spawn_blocking(move || entered.recv())
        .await
        .unwrap()
        .unwrap();
}

/// Camera whose first access request waits on a gate.
struct GatedCamera {
    inner: StubCamera,
    gate: Gate,
}

impl Camera for GatedCamera {
    fn name(&self) -> &str {
        "gated"
    }

    fn request_access(&self) -> Result<Access> {
        self.gate.pass()?;
        self.inner.request_access()
    }

    fn capture(&self) -> Result<Frame> {
        self.inner.capture()
    }
}

/// Store whose first scan write waits on a gate.
struct GatedStore {
    inner: InMemoryRecordStore,
    gate: Gate,
}

impl RecordStore for GatedStore {
    fn append_scan(&self, scan: NewScan) -> Result<ScanRecord> {
        self.gate.pass()?;
        self.inner.append_scan(scan)
    }

    fn append_notification(&self, notification: NewNotification) -> Result<NotificationRecord> {
        self.inner.append_notification(notification)
    }

    fn latest_scan(&self) -> Result<Option<ScanRecord>> {
        self.inner.latest_scan()
    }

    fn settings(&self) -> Result<Option<Settings>> {
        self.inner.settings()
    }

    fn save_settings(&self, settings: Settings) -> Result<Settings> {
        self.inner.save_settings(settings)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_permission_grant_after_cancel_is_discarded() {
    let (gate, entered, release) = Gate::new();
    let wf = Arc::new(ScanWorkflow::new(
        Arc::new(GatedCamera {
            inner: StubCamera::new("exit_camera", 8, 8),
            gate,
        }),
        Arc::new(DetectionPipeline::new(Arc::new(ScriptedLoader::new(
            blocked_exit(),
        )))),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(LogSink),
    ));

    let pending = {
        let wf = Arc::clone(&wf);
        tokio::spawn(async move { wf.start().await })
    };
    wait_entered(entered).await;
    assert_eq!(wf.phase(), WorkflowPhase::AwaitingPermission);

    assert_eq!(wf.cancel(), WorkflowPhase::AwaitingPermission);
    assert_eq!(wf.phase(), WorkflowPhase::Idle);

    // Second request is not gated and is granted straight away.
    assert_eq!(wf.start().await.unwrap(), WorkflowPhase::Live);
    release.send(()).unwrap();

    assert!(matches!(
        pending.await.unwrap(),
        Err(WorkflowError::Superseded)
    ));
    assert_eq!(wf.phase(), WorkflowPhase::Live);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_resolution_keeps_written_records() {
    let (gate, entered, release) = Gate::new();
    let store = Arc::new(GatedStore {
        inner: InMemoryRecordStore::new(),
        gate,
    });
    store.save_settings(notifying_settings()).unwrap();
    let sink = Arc::new(RecordingSink::delivering());
    let wf = Arc::new(workflow(
        ScriptedLoader::new(blocked_exit()),
        store.clone(),
        sink.clone(),
    ));

    wf.start().await.unwrap();
    wf.capture().await.unwrap();
    let resolving = {
        let wf = Arc::clone(&wf);
        tokio::spawn(async move { wf.confirm(Verdict::Blocked).await })
    };
    wait_entered(entered).await;
    assert_eq!(wf.phase(), WorkflowPhase::Resolving);

    assert_eq!(wf.cancel(), WorkflowPhase::Resolving);
    assert_eq!(wf.phase(), WorkflowPhase::Idle);
    release.send(()).unwrap();

    let resolution = resolving.await.unwrap().unwrap();
    assert_eq!(resolution.verdict, Verdict::Blocked);
    assert!(resolution.scan.is_ok());
    assert!(resolution.notification.is_delivered());
    assert_eq!(store.inner.scans().unwrap().len(), 1);
    assert_eq!(store.inner.notifications().unwrap().len(), 1);
    assert_eq!(sink.notices().len(), 1);
    assert_eq!(wf.phase(), WorkflowPhase::Idle);
}
