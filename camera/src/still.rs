use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use code_gate_common::frame::CapturedFrame;
use image::RgbImage;
use tracing::info;

use crate::{decode_image, CameraError, FrameSink, FrameSource};

enum Origin {
    File(PathBuf),
    Memory(Mutex<Option<RgbImage>>),
}

/// A single still image standing in for a camera. Published once on start.
pub struct StillSource {
    origin: Origin,
    sink: FrameSink,
}

impl StillSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            origin: Origin::File(path.into()),
            sink: FrameSink::new(),
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self {
            origin: Origin::Memory(Mutex::new(Some(image))),
            sink: FrameSink::new(),
        }
    }

    /// Publish another frame, as if the camera had captured it.
    pub fn push(&self, image: RgbImage) -> u64 {
        self.sink.push(image)
    }
}

impl FrameSource for StillSource {
    fn start(&self) -> Result<(), CameraError> {
        let image = match &self.origin {
            Origin::File(path) => {
                let data = std::fs::read(path)
                    .map_err(|e| CameraError::ReadImage(path.display().to_string(), e))?;
                decode_image(&data)?
            }
            Origin::Memory(image) => {
                match image.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    Some(image) => image,
                    // Already started.
                    None => return Ok(()),
                }
            }
        };
        let (width, height) = image.dimensions();
        self.sink.push(image);
        info!(width, height, "still image source started");
        Ok(())
    }

    fn read(&self) -> Option<Arc<CapturedFrame>> {
        self.sink.latest()
    }

    fn stop(&self) {}

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn in_memory_image_is_published_once() {
        let source = StillSource::from_image(RgbImage::from_pixel(8, 6, Rgb([1, 2, 3])));
        assert!(source.read().is_none());

        source.start().unwrap();
        let first = source.read().unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(first.image.get_pixel(0, 0), &Rgb([1, 2, 3]));

        source.start().unwrap();
        assert_eq!(source.read().unwrap().seq, 0, "restart must not republish");
    }

    #[test]
    fn pushed_frames_supersede_the_still() {
        let source = StillSource::from_image(RgbImage::new(2, 2));
        source.start().unwrap();
        assert_eq!(source.push(RgbImage::new(3, 3)), 1);
        assert_eq!(source.read().unwrap().image.dimensions(), (3, 3));
    }

    #[test]
    fn missing_file_fails_to_start() {
        let source = StillSource::from_path("/nonexistent/gate.jpg");
        assert!(matches!(source.start(), Err(CameraError::ReadImage(..))));
    }
}
