//! QR code detection using rqrr.

use std::panic::{self, AssertUnwindSafe};

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use nalgebra::Point2;
use rqrr::PreparedImage;
use tracing::trace;

/// A decoded code and where it sits in the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub payload: String,
    /// Corner points in frame pixel coordinates, in the decoder's order.
    pub corners: [Point2<f32>; 4],
}

/// Failures other than "there is no code in this frame".
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("frame has no pixels")]
    EmptyFrame,
    #[error("decoder panicked: {0}")]
    Panicked(String),
}

/// Locates and decodes a marker in a frame.
pub trait MarkerDetector: Send {
    /// `Ok(None)` means no decodable marker is present.
    fn detect(&self, frame: &RgbImage) -> Result<Option<Marker>, DetectError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// QR code detector working on a grayscale, optionally downscaled copy.
pub struct QrDetector {
    /// Frames larger than this are downscaled before detection.
    max_dimension: u32,
}

impl Default for QrDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl QrDetector {
    pub fn new() -> Self {
        Self {
            max_dimension: 1280,
        }
    }

    pub fn with_max_dimension(max_dimension: u32) -> Self {
        Self { max_dimension }
    }
}

impl MarkerDetector for QrDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Option<Marker>, DetectError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectError::EmptyFrame);
        }

        let scale = if self.max_dimension > 0 && width.max(height) > self.max_dimension {
            width.max(height) as f32 / self.max_dimension as f32
        } else {
            1.0
        };
        let gray = if scale > 1.0 {
            let resized = image::imageops::resize(
                frame,
                ((width as f32 / scale) as u32).max(1),
                ((height as f32 / scale) as u32).max(1),
                FilterType::Triangle,
            );
            DynamicImage::ImageRgb8(resized).to_luma8()
        } else {
            DynamicImage::ImageRgb8(frame.clone()).to_luma8()
        };

        let found = panic::catch_unwind(AssertUnwindSafe(move || {
            let mut prepared = PreparedImage::prepare(gray);
            let grids = prepared.detect_grids();
            trace!(grids = grids.len(), "QR grids located");
            grids.into_iter().find_map(|grid| match grid.decode() {
                Ok((_, content)) if !content.is_empty() => Some((content, grid.bounds)),
                Ok(_) => None,
                Err(e) => {
                    trace!(error = ?e, "QR grid did not decode");
                    None
                }
            })
        }))
        .map_err(|payload| DetectError::Panicked(panic_message(payload.as_ref())))?;

        Ok(found.map(|(payload, bounds)| Marker {
            payload,
            corners: bounds.map(|p| Point2::new(p.x as f32 * scale, p.y as f32 * scale)),
        }))
    }

    fn name(&self) -> &str {
        "qr"
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
