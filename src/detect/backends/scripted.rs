use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectorBackend, DetectorLoader};
use crate::detect::result::RawDetection;
use crate::frame::FrameView;

/// Backend that returns a fixed detection list for every frame.
///
/// Used for demos and tests where no model file is available.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    detections: Vec<RawDetection>,
    frames_seen: u64,
}

impl ScriptedBackend {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(&mut self, frame: &FrameView<'_>) -> Result<Vec<RawDetection>> {
        self.frames_seen += 1;
        log::debug!(
            "scripted backend: frame #{} ({}x{}), {} detections",
            self.frames_seen,
            frame.width(),
            frame.height(),
            self.detections.len()
        );
        Ok(self.detections.clone())
    }
}

enum Script {
    Inline(Vec<RawDetection>),
    Fixture(PathBuf),
}

/// Loader for `ScriptedBackend`, either from an inline list or from a JSON
/// fixture file (an array of `{label, confidence, bbox: {x, y, width, height}}`).
pub struct ScriptedLoader {
    script: Script,
}

impl ScriptedLoader {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            script: Script::Inline(detections),
        }
    }

    /// The fixture is read at load time, so a missing or malformed file
    /// surfaces as an unavailable model.
    pub fn from_fixture(path: impl Into<PathBuf>) -> Self {
        Self {
            script: Script::Fixture(path.into()),
        }
    }
}

impl DetectorLoader for ScriptedLoader {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load(&self) -> Result<Box<dyn DetectorBackend>> {
        let detections = match &self.script {
            Script::Inline(detections) => detections.clone(),
            Script::Fixture(path) => read_fixture(path)?,
        };
        Ok(Box::new(ScriptedBackend::new(detections)))
    }
}

fn read_fixture(path: &Path) -> Result<Vec<RawDetection>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read detection fixture {}: {}", path.display(), e))?;
    let detections = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid detection fixture {}: {}", path.display(), e))?;
    Ok(detections)
}
