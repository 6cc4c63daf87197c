//! Verdict overlay drawn onto the full frame.

use std::fs;

use ab_glyph::{point, Font, FontArc, FontVec, GlyphId, PxScale, ScaleFont};
use code_gate_common::config::AnnotationConfig;
use code_gate_common::verdict::Verdict;
use image::{Rgb, RgbImage};
use tracing::{debug, info, warn};

use crate::glyphs;

struct LabelStyle {
    text: &'static str,
    /// Drawn by the built-in font, which only knows a few Latin letters.
    fallback_text: &'static str,
    color: Rgb<u8>,
    shadow: Rgb<u8>,
}

const GO_STYLE: LabelStyle = LabelStyle {
    text: "通行",
    fallback_text: "GO",
    color: Rgb([0, 200, 0]),
    shadow: Rgb([0, 100, 0]),
};

const STOP_STYLE: LabelStyle = LabelStyle {
    text: "禁止通行",
    fallback_text: "STOP",
    color: Rgb([255, 50, 50]),
    shadow: Rgb([150, 0, 0]),
};

fn style(verdict: Verdict) -> &'static LabelStyle {
    match verdict {
        Verdict::Go => &GO_STYLE,
        Verdict::Stop => &STOP_STYLE,
    }
}

/// Draws the verdict label, with a drop shadow, onto a copy of a frame.
pub struct Annotator {
    font: Option<FontArc>,
    font_size: f32,
    shadow_offset: i32,
}

impl Annotator {
    /// Use the first font in `font_paths` that covers every label character.
    /// Falls back to the built-in bitmap font; never fails.
    pub fn load(config: &AnnotationConfig) -> Self {
        for path in &config.font_paths {
            let data = match fs::read(path) {
                Ok(data) => data,
                Err(e) => {
                    debug!(path = %path, error = %e, "font not readable");
                    continue;
                }
            };
            let font = match FontVec::try_from_vec(data) {
                Ok(font) => FontArc::new(font),
                Err(e) => {
                    debug!(path = %path, error = %e, "not a usable font file");
                    continue;
                }
            };
            if !covers_labels(&font) {
                debug!(path = %path, "font lacks glyphs for the labels");
                continue;
            }
            info!(path = %path, size = config.font_size, "loaded annotation font");
            return Self::with_font(font, config);
        }
        warn!(
            candidates = config.font_paths.len(),
            "no usable annotation font, using built-in bitmap font"
        );
        Self::builtin(config)
    }

    pub fn with_font(font: FontArc, config: &AnnotationConfig) -> Self {
        Self {
            font: Some(font),
            font_size: config.font_size,
            shadow_offset: config.shadow_offset,
        }
    }

    pub fn builtin(config: &AnnotationConfig) -> Self {
        Self {
            font: None,
            font_size: config.font_size,
            shadow_offset: config.shadow_offset,
        }
    }

    pub fn uses_builtin_font(&self) -> bool {
        self.font.is_none()
    }

    /// Return a same-sized copy of `frame` carrying the label for `verdict`,
    /// centered horizontally with its top at one third of the height.
    pub fn annotate(&self, frame: &RgbImage, verdict: Verdict) -> RgbImage {
        let mut out = frame.clone();
        let style = style(verdict);
        let top = frame.height() as i32 / 3;
        let off = self.shadow_offset;

        match &self.font {
            Some(font) => {
                let scale = PxScale::from(self.font_size);
                let width = text_width(font, scale, style.text);
                let left = (frame.width() as f32 - width) / 2.0;
                let shadow_at = (left + off as f32, (top + off) as f32);
                draw_text(&mut out, font, scale, shadow_at, style.text, style.shadow);
                draw_text(&mut out, font, scale, (left, top as f32), style.text, style.color);
            }
            None => {
                let scale = self.builtin_scale();
                let width = glyphs::text_width(style.fallback_text, scale) as i32;
                let left = (frame.width() as i32 - width) / 2;
                let text = style.fallback_text;
                glyphs::draw_text(&mut out, left + off, top + off, text, scale, style.shadow);
                glyphs::draw_text(&mut out, left, top, text, scale, style.color);
            }
        }
        out
    }

    /// Block size that makes the 7-row bitmap about as tall as the capital
    /// letters of a real font at `font_size`.
    fn builtin_scale(&self) -> u32 {
        ((self.font_size * 0.7 / glyphs::GLYPH_HEIGHT as f32).round() as u32).max(1)
    }
}

fn covers_labels(font: &FontArc) -> bool {
    [&GO_STYLE, &STOP_STYLE]
        .iter()
        .flat_map(|s| s.text.chars())
        .all(|c| font.glyph_id(c) != GlyphId(0))
}

fn text_width(font: &FontArc, scale: PxScale, text: &str) -> f32 {
    let scaled = font.as_scaled(scale);
    let mut width = 0.0;
    let mut previous: Option<GlyphId> = None;
    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(prev) = previous {
            width += scaled.kern(prev, id);
        }
        width += scaled.h_advance(id);
        previous = Some(id);
    }
    width
}

/// Rasterize `text` with the top of its ascent at `top`, alpha-blending
/// glyph coverage over the existing pixels.
fn draw_text(
    image: &mut RgbImage,
    font: &FontArc,
    scale: PxScale,
    (left, top): (f32, f32),
    text: &str,
    color: Rgb<u8>,
) {
    let scaled = font.as_scaled(scale);
    let baseline = top + scaled.ascent();
    let (width, height) = (image.width() as i32, image.height() as i32);

    let mut caret = left;
    let mut previous: Option<GlyphId> = None;
    for ch in text.chars() {
        let id = scaled.glyph_id(ch);
        if let Some(prev) = previous {
            caret += scaled.kern(prev, id);
        }
        let glyph = id.with_scale_and_position(scale, point(caret, baseline));
        caret += scaled.h_advance(id);
        previous = Some(id);

        let Some(outlined) = font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        outlined.draw(|gx, gy, coverage| {
            let x = bounds.min.x as i32 + gx as i32;
            let y = bounds.min.y as i32 + gy as i32;
            if x < 0 || y < 0 || x >= width || y >= height {
                return;
            }
            let pixel = image.get_pixel_mut(x as u32, y as u32);
            let alpha = coverage.clamp(0.0, 1.0);
            for c in 0..3 {
                let blended = pixel[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha;
                pixel[c] = blended.round() as u8;
            }
        });
    }
}
