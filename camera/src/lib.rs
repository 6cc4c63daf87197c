//! Frame sources: where the gate gets its camera frames from.
//!
//! Every source captures on its own background thread or task and keeps only
//! the most recent frame, so `read` never blocks.

mod backoff;
pub mod convert;
pub mod mjpeg;
pub mod still;
#[cfg(feature = "v4l")]
pub mod v4l2;

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use code_gate_common::frame::CapturedFrame;
use code_gate_common::slot::LatestSlot;
use image::{ImageReader, RgbImage};

pub use mjpeg::MjpegSource;
pub use still::StillSource;
#[cfg(feature = "v4l")]
pub use v4l2::V4lSource;

/// A camera that continuously supplies its most recent frame.
pub trait FrameSource: Send + Sync {
    /// Acquire the device and begin capturing. Errors here are fatal to the caller.
    fn start(&self) -> Result<(), CameraError>;

    /// The latest captured frame, or `None` if nothing has arrived yet.
    fn read(&self) -> Option<Arc<CapturedFrame>>;

    /// Stop capturing and release the device. Best effort; never fails.
    fn stop(&self);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("failed to open camera {0}: {1}")]
    Open(String, String),
    #[error("unsupported camera format: {0}")]
    Format(String),
    #[error("invalid stream URL {0}: {1}")]
    InvalidUrl(String, String),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to read image {0}: {1}")]
    ReadImage(String, std::io::Error),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("source `{0}` is not available in this build")]
    Unavailable(String),
}

/// Latest-frame buffer shared between a capture worker and its readers.
#[derive(Debug, Default)]
pub struct FrameSink {
    slot: LatestSlot<CapturedFrame>,
    next_seq: AtomicU64,
}

impl FrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp and publish a freshly captured image. Returns its sequence number.
    pub fn push(&self, image: RgbImage) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.slot.publish(CapturedFrame::new(image, seq));
        seq
    }

    pub fn latest(&self) -> Option<Arc<CapturedFrame>> {
        self.slot.snapshot()
    }

    /// Frames published so far.
    pub fn count(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }
}

/// Decode a compressed image (JPEG, PNG, ...) into RGB8.
pub fn decode_image(data: &[u8]) -> Result<RgbImage, CameraError> {
    let image = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| CameraError::ReadImage("<memory>".into(), e))?
        .decode()?;
    Ok(image.to_rgb8())
}
