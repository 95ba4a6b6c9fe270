//! Captured frame handle.
//!
//! - `Frame`: opaque container for one captured RGB image. Bytes are private.
//! - `FrameView`: read-only view handed to a detector for one inference call.
//!
//! Records never carry pixels. They carry `Frame::image_ref()`, a content hash
//! derived from the pixel content.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Opaque captured frame. No `Clone` and no byte accessor; detectors read
/// pixels through `FrameView` only.
pub struct Frame {
    /// Packed RGB8, row-major.
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    captured_at_s: u64,
}

impl Frame {
    /// Wrap packed RGB8 pixels. The buffer length must be `width * height * 3`.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at_s: crate::now_s()?,
        })
    }

    /// Seconds since epoch at which the frame was wrapped.
    pub fn captured_at_s(&self) -> u64 {
        self.captured_at_s
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView { frame: self }
    }

    /// Stable reference used in scan and notification records.
    pub fn image_ref(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.width.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update(&self.data);
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at_s", &self.captured_at_s)
            .finish_non_exhaustive()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Read-only view of a frame for the duration of one inference call.
pub struct FrameView<'a> {
    frame: &'a Frame,
}

impl<'a> FrameView<'a> {
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    /// Packed RGB8 pixels. Backends must not retain this slice past `infer`.
    pub fn pixels(&self) -> &'a [u8] {
        &self.frame.data
    }
}
