//! Dominant-color verdict over a rectified region.
//!
//! HSV values use the 8-bit convention common to vision libraries: hue in
//! `0..=179` (degrees halved), saturation and value in `0..=255`.

use code_gate_common::verdict::Verdict;
use image::{Rgb, RgbImage};

/// Inclusive per-channel HSV bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl HsvRange {
    pub const fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    #[inline]
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|c| self.lower[c] <= hsv[c] && hsv[c] <= self.upper[c])
    }
}

pub const RED: HsvRange = HsvRange::new([3, 60, 60], [5, 255, 255]);
// Overlaps GREEN on hue 69..=88; kept as is.
pub const ORANGE: HsvRange = HsvRange::new([5, 100, 150], [88, 255, 255]);
pub const GREEN: HsvRange = HsvRange::new([69, 63, 97], [135, 255, 255]);

/// An image whose three channels hold H, S and V.
#[derive(Debug, Clone)]
pub struct HsvImage(RgbImage);

impl HsvImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    pub fn get(&self, x: u32, y: u32) -> [u8; 3] {
        self.0.get_pixel(x, y).0
    }

    pub fn pixels(&self) -> impl Iterator<Item = [u8; 3]> + '_ {
        self.0.pixels().map(|p| p.0)
    }

    /// Build directly from HSV triples, for callers that already have them.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 3]) -> Self {
        Self(RgbImage::from_fn(width, height, |x, y| Rgb(f(x, y))))
    }
}

/// Convert one RGB pixel to 8-bit HSV.
pub fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    if v == 0 {
        return [0, 0, 0];
    }
    let vf = v as f32;
    let diff = vf - min as f32;
    let s = (255.0 * diff / vf).round() as u8;
    if diff == 0.0 {
        return [0, s, v];
    }

    let mut deg = if v == r {
        60.0 * (gf - bf) / diff
    } else if v == g {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    if deg < 0.0 {
        deg += 360.0;
    }
    let h = (deg / 2.0).round() as u16 % 180;
    [h as u8, s, v]
}

pub fn to_hsv(image: &RgbImage) -> HsvImage {
    HsvImage(RgbImage::from_fn(image.width(), image.height(), |x, y| {
        Rgb(rgb_to_hsv(image.get_pixel(x, y).0))
    }))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelCounts {
    pub red: u64,
    pub orange: u64,
    pub green: u64,
}

impl PixelCounts {
    /// GO only when green strictly outnumbers both red and orange.
    pub fn verdict(&self) -> Verdict {
        if self.green > self.red && self.green > self.orange {
            Verdict::Go
        } else {
            Verdict::Stop
        }
    }
}

/// Count pixels in each range. A pixel may count toward several ranges.
pub fn count_pixels(image: &HsvImage) -> PixelCounts {
    image.pixels().fold(PixelCounts::default(), |mut acc, p| {
        acc.red += RED.contains(p) as u64;
        acc.orange += ORANGE.contains(p) as u64;
        acc.green += GREEN.contains(p) as u64;
        acc
    })
}

pub fn classify(image: &HsvImage) -> Verdict {
    count_pixels(image).verdict()
}
