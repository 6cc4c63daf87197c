use std::sync::OnceLock;

use bytes::Bytes;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::verdict::Verdict;

/// A raw camera frame with capture metadata.
///
/// `seq` is monotonic per frame source, so consumers can tell a fresh frame
/// from one they have already seen.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: RgbImage,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl CapturedFrame {
    /// Stamp a frame with the current wall-clock time.
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms: Utc::now().timestamp_millis(),
            seq,
        }
    }
}

/// The output of one processing iteration, as served to stream clients.
///
/// Once published this value is never mutated. The JPEG encoding is computed
/// by whichever reader asks first and shared with every later reader.
#[derive(Debug)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub seq: u64,
    pub captured_at_ms: i64,
    /// `None` when no marker was found in the frame.
    pub verdict: Option<Verdict>,
    pub payload: Option<String>,
    jpeg: OnceLock<Bytes>,
}

impl AnnotatedFrame {
    /// A frame published as captured, without a verdict.
    pub fn raw(frame: &CapturedFrame) -> Self {
        Self {
            image: frame.image.clone(),
            seq: frame.seq,
            captured_at_ms: frame.captured_at_ms,
            verdict: None,
            payload: None,
            jpeg: OnceLock::new(),
        }
    }

    /// A frame carrying a classification result.
    pub fn classified(
        frame: &CapturedFrame,
        image: RgbImage,
        verdict: Verdict,
        payload: String,
    ) -> Self {
        Self {
            image,
            seq: frame.seq,
            captured_at_ms: frame.captured_at_ms,
            verdict: Some(verdict),
            payload: Some(payload),
            jpeg: OnceLock::new(),
        }
    }

    /// JPEG bytes for this frame. Encoded once; the first caller's quality wins.
    pub fn jpeg(&self, quality: u8) -> Result<Bytes, image::ImageError> {
        if let Some(cached) = self.jpeg.get() {
            return Ok(cached.clone());
        }
        let encoded = encode_jpeg(&self.image, quality)?;
        Ok(self.jpeg.get_or_init(|| encoded).clone())
    }
}

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, image::ImageError> {
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frame(seq: u64) -> CapturedFrame {
        CapturedFrame::new(RgbImage::from_pixel(32, 24, Rgb([10, 120, 200])), seq)
    }

    #[test]
    fn raw_frame_keeps_source_metadata() {
        let captured = frame(7);
        let published = AnnotatedFrame::raw(&captured);
        assert_eq!(published.seq, 7);
        assert_eq!(published.captured_at_ms, captured.captured_at_ms);
        assert!(published.verdict.is_none());
        assert!(published.payload.is_none());
        assert_eq!(published.image.dimensions(), (32, 24));
    }

    #[test]
    fn jpeg_is_decodable_and_cached() {
        let published = AnnotatedFrame::raw(&frame(1));
        let first = published.jpeg(80).unwrap();
        assert_eq!(&first[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&first).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));

        let second = published.jpeg(10).unwrap();
        assert_eq!(first, second, "second call must reuse the cached encoding");
    }

    #[test]
    fn classified_frame_carries_verdict() {
        let captured = frame(3);
        let image = captured.image.clone();
        let published =
            AnnotatedFrame::classified(&captured, image, Verdict::Go, "patient-42".into());
        assert_eq!(published.verdict, Some(Verdict::Go));
        assert_eq!(published.payload.as_deref(), Some("patient-42"));
    }
}
