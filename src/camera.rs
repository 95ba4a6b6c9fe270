//! Camera collaborators.
//!
//! A camera grants or refuses access, then yields exactly one frame per
//! `capture` call. Sources:
//! - `stub://<name>`: synthetic frames, always granted (testing, demos)
//! - local image path (feature: capture-file)

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};

use crate::frame::Frame;

/// Outcome of an access request. Device errors are reported as `Err`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied,
}

pub trait Camera: Send + Sync {
    fn name(&self) -> &str;

    /// Ask for access to the device. May block while the user decides.
    fn request_access(&self) -> Result<Access>;

    /// Grab one frame from the live preview.
    fn capture(&self) -> Result<Frame>;

    /// Stop the live preview. Called when a session is cancelled or completes.
    fn release(&self) {}
}

/// Build a camera from a configured source string.
pub fn camera_from_source(source: &str) -> Result<Box<dyn Camera>> {
    if source.trim().is_empty() {
        return Err(anyhow!("camera source must not be empty"));
    }
    if let Some(name) = source.strip_prefix("stub://") {
        return Ok(Box::new(StubCamera::new(name, 640, 480)));
    }
    if source.contains("://") {
        return Err(anyhow!(
            "camera source {} is not supported (use stub:// or a local image path)",
            source
        ));
    }
    #[cfg(feature = "capture-file")]
    {
        Ok(Box::new(FileCamera::new(source)))
    }
    #[cfg(not(feature = "capture-file"))]
    {
        Err(anyhow!("file capture requires the capture-file feature"))
    }
}

// ----------------------------------------------------------------------------
// Synthetic camera (stub://) for tests
// ----------------------------------------------------------------------------

pub struct StubCamera {
    name: String,
    width: u32,
    height: u32,
    grant: bool,
    frames_captured: AtomicU64,
}

impl StubCamera {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            grant: true,
            frames_captured: AtomicU64::new(0),
        }
    }

    /// A camera whose access request is always refused.
    pub fn denying(mut self) -> Self {
        self.grant = false;
        self
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::SeqCst)
    }

    fn synthetic_pixels(&self, frame_count: u64) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + frame_count) % 256) as u8;
        }
        pixels
    }
}

impl Camera for StubCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_access(&self) -> Result<Access> {
        if self.grant {
            log::info!("StubCamera: access granted for {}", self.name);
            Ok(Access::Granted)
        } else {
            Ok(Access::Denied)
        }
    }

    fn capture(&self) -> Result<Frame> {
        let frame_count = self.frames_captured.fetch_add(1, Ordering::SeqCst) + 1;
        Frame::from_rgb(
            self.synthetic_pixels(frame_count),
            self.width,
            self.height,
        )
    }
}

// ----------------------------------------------------------------------------
// Still image on disk
// ----------------------------------------------------------------------------

/// Treats a local image file as the camera's current view.
#[cfg(feature = "capture-file")]
pub struct FileCamera {
    path: std::path::PathBuf,
}

#[cfg(feature = "capture-file")]
impl FileCamera {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(feature = "capture-file")]
impl Camera for FileCamera {
    fn name(&self) -> &str {
        "file"
    }

    fn request_access(&self) -> Result<Access> {
        let meta = std::fs::metadata(&self.path)
            .map_err(|e| anyhow!("cannot open {}: {}", self.path.display(), e))?;
        if meta.is_file() {
            Ok(Access::Granted)
        } else {
            Ok(Access::Denied)
        }
    }

    fn capture(&self) -> Result<Frame> {
        let image = image::open(&self.path)
            .map_err(|e| anyhow!("failed to decode {}: {}", self.path.display(), e))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Frame::from_rgb(image.into_raw(), width, height)
    }
}
