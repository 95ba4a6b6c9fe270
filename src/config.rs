use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::detect::{Thresholds, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::geometry::DEFAULT_OVERLAP_RATIO;

const DEFAULT_DB_PATH: &str = "exit_witness.db";
const DEFAULT_CAMERA_SOURCE: &str = "stub://exit_camera";
const DEFAULT_INPUT_SIZE: u32 = 300;
const DEFAULT_MQTT_TOPIC: &str = "exit-witness/alerts";

/// Class-id order of the bundled SSD exit detector.
const DEFAULT_LABELS: &[&str] = &[
    "background",
    "exit_sign",
    "emergency_exit",
    "person",
    "box",
    "pallet",
    "chair",
    "cart",
    "forklift",
    "machinery",
];

#[derive(Debug, Deserialize, Default)]
struct ScanConfigFile {
    db_path: Option<String>,
    detection: Option<DetectionConfigFile>,
    camera: Option<CameraConfigFile>,
    notify: Option<NotifyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    confidence_threshold: Option<f32>,
    overlap_ratio: Option<f32>,
    model_path: Option<PathBuf>,
    labels: Option<Vec<String>>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    mqtt_broker: Option<String>,
    mqtt_topic: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Detections replayed from a fixture (or none).
    Scripted,
    /// ONNX model run through tract (feature: backend-tract).
    Tract,
}

impl BackendKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scripted" => Ok(BackendKind::Scripted),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!(
                "unknown detection backend {:?} (expected scripted or tract)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub db_path: String,
    pub detection: DetectionSettings,
    pub camera_source: String,
    pub notify: NotifySettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: BackendKind,
    pub thresholds: Thresholds,
    pub model_path: Option<PathBuf>,
    pub labels: Vec<String>,
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub mqtt_broker: Option<String>,
    pub mqtt_topic: String,
}

impl ScanConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EXIT_WITNESS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ScanConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let detection_file = file.detection.unwrap_or_default();
        let backend = match detection_file.backend.as_deref() {
            Some(value) => BackendKind::parse(value)?,
            None => BackendKind::Scripted,
        };
        let detection = DetectionSettings {
            backend,
            thresholds: Thresholds {
                confidence: detection_file
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                overlap_ratio: detection_file
                    .overlap_ratio
                    .unwrap_or(DEFAULT_OVERLAP_RATIO),
            },
            model_path: detection_file.model_path,
            labels: detection_file
                .labels
                .unwrap_or_else(|| DEFAULT_LABELS.iter().map(|l| l.to_string()).collect()),
            input_width: detection_file.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
            input_height: detection_file.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
        };
        let camera_source = file
            .camera
            .and_then(|camera| camera.source)
            .unwrap_or_else(|| DEFAULT_CAMERA_SOURCE.to_string());
        let notify_file = file.notify.unwrap_or_default();
        let notify = NotifySettings {
            mqtt_broker: notify_file.mqtt_broker,
            mqtt_topic: notify_file
                .mqtt_topic
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
        };
        Ok(Self {
            db_path,
            detection,
            camera_source,
            notify,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("EXIT_WITNESS_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(confidence) = std::env::var("EXIT_WITNESS_CONFIDENCE") {
            if !confidence.trim().is_empty() {
                self.detection.thresholds.confidence =
                    confidence.trim().parse().map_err(|_| {
                        anyhow!("EXIT_WITNESS_CONFIDENCE must be a number between 0 and 1")
                    })?;
            }
        }
        if let Ok(source) = std::env::var("EXIT_WITNESS_CAMERA") {
            if !source.trim().is_empty() {
                self.camera_source = source;
            }
        }
        if let Ok(path) = std::env::var("EXIT_WITNESS_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detection.model_path = Some(PathBuf::from(path));
                self.detection.backend = BackendKind::Tract;
            }
        }
        if let Ok(broker) = std::env::var("EXIT_WITNESS_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                self.notify.mqtt_broker = Some(broker);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let thresholds = self.detection.thresholds;
        if !(0.0..=1.0).contains(&thresholds.confidence) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                thresholds.confidence
            ));
        }
        if !(thresholds.overlap_ratio > 0.0 && thresholds.overlap_ratio <= 1.0) {
            return Err(anyhow!(
                "overlap ratio must be within (0, 1], got {}",
                thresholds.overlap_ratio
            ));
        }
        if self.detection.backend == BackendKind::Tract && self.detection.model_path.is_none() {
            return Err(anyhow!("tract backend requires detection.model_path"));
        }
        if self.detection.input_width == 0 || self.detection.input_height == 0 {
            return Err(anyhow!("model input dimensions must be greater than zero"));
        }
        self.detection.labels = self
            .detection
            .labels
            .iter()
            .map(|label| label.trim().to_string())
            .collect();
        if self.detection.labels.is_empty() {
            return Err(anyhow!("detection.labels must not be empty"));
        }
        if self.camera_source.trim().is_empty() {
            return Err(anyhow!("camera.source must not be empty"));
        }
        if self.notify.mqtt_topic.trim().is_empty() {
            return Err(anyhow!("notify.mqtt_topic must not be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ScanConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
