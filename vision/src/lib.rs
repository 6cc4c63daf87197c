//! Image stages of the gate: find the code, straighten it, judge its color,
//! and tell the person in front of the camera.

pub mod alert;
pub mod annotate;
pub mod classify;
pub mod detect;
mod glyphs;
pub mod rectify;

pub use alert::{spawn_alert_worker, spawn_alert_worker_with, AlertSender, Tone, TonePlayer};
pub use annotate::Annotator;
pub use classify::{classify, count_pixels, to_hsv, PixelCounts};
pub use detect::{DetectError, Marker, MarkerDetector, QrDetector};
pub use rectify::{four_point_transform, RectifyError};
