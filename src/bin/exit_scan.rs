//! exit_scan - one-shot emergency exit obstruction check
//!
//! 1. Requests camera access and captures a single frame
//! 2. Runs detection and blockage assessment on it
//! 3. Shows the suggestion and asks for a human verdict
//! 4. Records the verdict and notifies the configured contact if blocked

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

use exit_witness::config::{BackendKind, ScanConfig};
use exit_witness::{
    camera_from_source, AssessmentResult, Camera, DetectionPipeline, DetectorLoader, LogSink,
    NotificationOutcome, NotificationSink, RecordStore, Resolution, ScanWorkflow, ScriptedLoader,
    Settings, SqliteRecordStore, Verdict, WorkflowError, WorkflowPhase,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture a frame, assess it, and record a verdict.
    Scan {
        /// Replay detections from a JSON fixture instead of the configured backend.
        #[arg(long, value_name = "FILE")]
        detections: Option<PathBuf>,
        /// Verdict to record without prompting.
        #[arg(long, value_enum)]
        verdict: Option<VerdictArg>,
    },
    /// Show or update notification settings.
    Settings {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, value_enum)]
        notifications: Option<Toggle>,
        /// Detection sensitivity (1-5).
        #[arg(long)]
        sensitivity: Option<u8>,
    },
    /// Print the most recent scan record.
    Latest,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VerdictArg {
    Blocked,
    Clear,
}

impl From<VerdictArg> for Verdict {
    fn from(value: VerdictArg) -> Self {
        match value {
            VerdictArg::Blocked => Verdict::Blocked,
            VerdictArg::Clear => Verdict::Clear,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = ScanConfig::load().context("loading configuration")?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(&cfg.db_path)?);

    match args.command {
        Command::Scan {
            detections,
            verdict,
        } => run_scan(&cfg, store, detections, verdict.map(Verdict::from)).await,
        Command::Settings {
            email,
            phone,
            notifications,
            sensitivity,
        } => {
            let mut settings = store.settings()?.unwrap_or_default();
            if let Some(email) = email {
                settings.recipient_email = non_empty(email);
            }
            if let Some(phone) = phone {
                settings.recipient_phone = non_empty(phone);
            }
            if let Some(toggle) = notifications {
                settings.notifications_enabled = matches!(toggle, Toggle::On);
            }
            if let Some(sensitivity) = sensitivity {
                settings.sensitivity = sensitivity;
            }
            let saved = store.save_settings(settings)?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
            Ok(())
        }
        Command::Latest => {
            match store.latest_scan()? {
                Some(scan) => println!("{}", serde_json::to_string_pretty(&scan)?),
                None => println!("no scans recorded"),
            }
            Ok(())
        }
    }
}

async fn run_scan(
    cfg: &ScanConfig,
    store: Arc<dyn RecordStore>,
    detections: Option<PathBuf>,
    verdict: Option<Verdict>,
) -> Result<()> {
    let settings: Settings = store.settings()?.unwrap_or_default();
    log::info!(
        "scan starting (camera {}, sensitivity {})",
        cfg.camera_source,
        settings.sensitivity
    );

    let camera: Arc<dyn Camera> = Arc::from(camera_from_source(&cfg.camera_source)?);
    let pipeline = Arc::new(
        DetectionPipeline::new(build_loader(cfg, detections)?)
            .with_thresholds(cfg.detection.thresholds),
    );
    let workflow = Arc::new(ScanWorkflow::new(camera, pipeline, store, build_sink(cfg)?));

    let cancelled = Arc::new(Notify::new());
    {
        let workflow = Arc::clone(&workflow);
        let cancelled = Arc::clone(&cancelled);
        ctrlc::set_handler(move || {
            let abandoned = workflow.cancel();
            log::warn!("scan cancelled during {:?}", abandoned);
            cancelled.notify_one();
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let verdict = tokio::select! {
        verdict = await_verdict(&workflow, verdict) => verdict?,
        _ = cancelled.notified() => {
            println!("scan cancelled");
            return Ok(());
        }
    };

    // Once confirmed, Ctrl-C still cancels the session but the resolution
    // runs to completion.
    match workflow.confirm(verdict).await {
        Ok(resolution) => print_resolution(&resolution),
        Err(WorkflowError::InvalidTransition { .. }) if workflow.phase() == WorkflowPhase::Idle => {
            println!("scan cancelled");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Start a session, assess one frame, and obtain the human verdict.
async fn await_verdict(workflow: &ScanWorkflow, verdict: Option<Verdict>) -> Result<Verdict> {
    if workflow.start().await? == WorkflowPhase::PermissionDenied {
        return Err(anyhow!("camera access denied"));
    }

    let result = workflow.capture().await?;
    print_assessment(&result);
    let suggested = workflow
        .suggested_verdict()
        .ok_or_else(|| anyhow!("no assessment awaiting a verdict"))?;

    match verdict {
        Some(verdict) => Ok(verdict),
        None => prompt_verdict(suggested).await,
    }
}

fn build_loader(cfg: &ScanConfig, detections: Option<PathBuf>) -> Result<Arc<dyn DetectorLoader>> {
    if let Some(path) = detections {
        return Ok(Arc::new(ScriptedLoader::from_fixture(path)));
    }
    match cfg.detection.backend {
        BackendKind::Scripted => {
            log::warn!("no detection fixture given; scripted backend will report nothing");
            Ok(Arc::new(ScriptedLoader::new(Vec::new())))
        }
        BackendKind::Tract => build_tract_loader(cfg),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract_loader(cfg: &ScanConfig) -> Result<Arc<dyn DetectorLoader>> {
    use exit_witness::detect::backends::TractLoader;

    let model_path = cfg
        .detection
        .model_path
        .clone()
        .ok_or_else(|| anyhow!("tract backend requires detection.model_path"))?;
    Ok(Arc::new(TractLoader::new(
        model_path,
        cfg.detection.labels.clone(),
        cfg.detection.input_width,
        cfg.detection.input_height,
    )))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract_loader(_cfg: &ScanConfig) -> Result<Arc<dyn DetectorLoader>> {
    Err(anyhow!("tract backend requires the backend-tract feature"))
}

fn build_sink(cfg: &ScanConfig) -> Result<Arc<dyn NotificationSink>> {
    match cfg.notify.mqtt_broker.as_deref() {
        #[cfg(feature = "notify-mqtt")]
        Some(broker) => {
            let sink = exit_witness::notify::MqttSink::connect(broker, &cfg.notify.mqtt_topic)?;
            log::info!("notifications published to {} on {}", broker, cfg.notify.mqtt_topic);
            Ok(Arc::new(sink))
        }
        #[cfg(not(feature = "notify-mqtt"))]
        Some(broker) => {
            log::warn!(
                "MQTT broker {} configured but notify-mqtt feature is off; logging notices",
                broker
            );
            Ok(Arc::new(LogSink))
        }
        None => Ok(Arc::new(LogSink)),
    }
}

/// Reads from a detached thread so Ctrl-C is not held up by a pending read.
async fn prompt_verdict(suggested: Verdict) -> Result<Verdict> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(read_verdict(suggested));
    });
    rx.await.map_err(|_| anyhow!("verdict prompt closed"))?
}

fn read_verdict(suggested: Verdict) -> Result<Verdict> {
    let default = match suggested {
        Verdict::Blocked => "blocked",
        Verdict::Clear => "clear",
    };
    let stdin = std::io::stdin();
    loop {
        println!("Is the exit blocked? [blocked/clear] (suggested: {})", default);
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Err(anyhow!("no verdict given"));
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "" => return Ok(suggested),
            "b" | "blocked" | "y" | "yes" => return Ok(Verdict::Blocked),
            "c" | "clear" | "n" | "no" => return Ok(Verdict::Clear),
            other => println!("unrecognised answer {:?}", other),
        }
    }
}

fn print_assessment(result: &AssessmentResult) {
    println!("detections: {}", result.detections().len());
    for d in result.detections() {
        let b = &d.detection.bbox;
        let state = if d.is_blocked() {
            " [blocked]"
        } else if d.is_blocking() {
            " [blocking]"
        } else {
            ""
        };
        println!(
            "  {:?} {:?} {:.2} at ({:.0}, {:.0}, {:.0}x{:.0}){}",
            d.domain_class,
            d.detection.native_label,
            d.detection.confidence,
            b.x,
            b.y,
            b.width,
            b.height,
            state
        );
    }
    println!(
        "suggestion: exit {}",
        if result.exit_blocked() {
            "appears BLOCKED"
        } else {
            "appears clear"
        }
    );
}

fn print_resolution(resolution: &Resolution) {
    match &resolution.scan {
        Ok(scan) => println!("recorded scan #{} ({:?})", scan.id, resolution.verdict),
        Err(e) => println!("verdict {:?} NOT recorded: {}", resolution.verdict, e),
    }
    match &resolution.notification {
        NotificationOutcome::NotRequested => {}
        NotificationOutcome::Skipped(reason) => println!("notification skipped: {}", reason),
        NotificationOutcome::Unavailable(e) => println!("notification not attempted: {}", e),
        NotificationOutcome::Attempted { status, error, .. } => match error {
            Some(e) => println!("notification {}: {}", status.as_str(), e),
            None => println!("notification {}", status.as_str()),
        },
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
