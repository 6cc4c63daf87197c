//! Perspective correction of a quadrilateral region into an upright image.

use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RectifyError {
    #[error("quadrilateral collapses to {width}x{height} pixels")]
    Degenerate { width: u32, height: u32 },
    #[error("corner points do not define a projective transform")]
    Singular,
}

/// Projective transform between two planes: `dst ~ H * src`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    #[inline]
    pub fn apply(&self, p: Point2<f32>) -> Point2<f32> {
        let v = self.h * Vector3::new(p.x as f64, p.y as f64, 1.0);
        let w = v[2];
        Point2::new((v[0] / w) as f32, (v[1] / w) as f32)
    }

    /// Solve for H from exactly four correspondences (h33 fixed to 1).
    ///
    /// Corner order must be consistent between `src` and `dst`.
    pub fn from_4pt(src: &[Point2<f32>; 4], dst: &[Point2<f32>; 4]) -> Option<Self> {
        // Unknowns: [h11 h12 h13 h21 h22 h23 h31 h32]
        // h11 x + h12 y + h13 - u h31 x - u h32 y = u
        // h21 x + h22 y + h23 - v h31 x - v h32 y = v
        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();

        for k in 0..4 {
            let (x, y) = (src[k].x as f64, src[k].y as f64);
            let (u, v) = (dst[k].x as f64, dst[k].y as f64);

            let r0 = 2 * k;
            a[(r0, 0)] = x;
            a[(r0, 1)] = y;
            a[(r0, 2)] = 1.0;
            a[(r0, 6)] = -u * x;
            a[(r0, 7)] = -u * y;
            b[r0] = u;

            let r1 = 2 * k + 1;
            a[(r1, 3)] = x;
            a[(r1, 4)] = y;
            a[(r1, 5)] = 1.0;
            a[(r1, 6)] = -v * x;
            a[(r1, 7)] = -v * y;
            b[r1] = v;
        }

        let x = a.lu().solve(&b)?;
        if x.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self {
            h: Matrix3::new(
                x[0], x[1], x[2], //
                x[3], x[4], x[5], //
                x[6], x[7], 1.0,
            ),
        })
    }
}

/// Order corners as top-left, top-right, bottom-right, bottom-left.
///
/// Top-left has the smallest `x + y`, bottom-right the largest; top-right has
/// the smallest `y - x`, bottom-left the largest.
pub fn order_points(pts: &[Point2<f32>; 4]) -> [Point2<f32>; 4] {
    let by = |key: fn(&Point2<f32>) -> f32, largest: bool| {
        let mut best = pts[0];
        for p in &pts[1..] {
            let better = if largest {
                key(p) > key(&best)
            } else {
                key(p) < key(&best)
            };
            if better {
                best = *p;
            }
        }
        best
    };
    let sum = |p: &Point2<f32>| p.x + p.y;
    let diff = |p: &Point2<f32>| p.y - p.x;
    [
        by(sum, false),
        by(diff, false),
        by(sum, true),
        by(diff, true),
    ]
}

/// Warp the quadrilateral `corners` of `image` into an axis-aligned image.
///
/// The output is as wide as the longer of the top and bottom edges and as
/// tall as the longer of the left and right edges. Samples outside the source
/// are black.
pub fn four_point_transform(
    image: &RgbImage,
    corners: &[Point2<f32>; 4],
) -> Result<RgbImage, RectifyError> {
    let [tl, tr, br, bl] = order_points(corners);

    let dist = |a: Point2<f32>, b: Point2<f32>| (a - b).norm();
    let width = dist(br, bl).max(dist(tr, tl)) as u32;
    let height = dist(tr, br).max(dist(tl, bl)) as u32;
    if width < 2 || height < 2 {
        return Err(RectifyError::Degenerate { width, height });
    }

    let (w, h) = ((width - 1) as f32, (height - 1) as f32);
    let rect = [
        Point2::new(0.0, 0.0),
        Point2::new(w, 0.0),
        Point2::new(w, h),
        Point2::new(0.0, h),
    ];
    let img_from_rect =
        Homography::from_4pt(&rect, &[tl, tr, br, bl]).ok_or(RectifyError::Singular)?;

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let p = img_from_rect.apply(Point2::new(x as f32, y as f32));
        sample_bilinear(image, p.x, p.y)
    }))
}

#[inline]
fn pixel_or_black(image: &RgbImage, x: i32, y: i32) -> [f32; 3] {
    if x < 0 || y < 0 || x >= image.width() as i32 || y >= image.height() as i32 {
        return [0.0; 3];
    }
    let Rgb(p) = *image.get_pixel(x as u32, y as u32);
    [p[0] as f32, p[1] as f32, p[2] as f32]
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    if !x.is_finite() || !y.is_finite() {
        return Rgb([0, 0, 0]);
    }
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = pixel_or_black(image, x0, y0);
    let p10 = pixel_or_black(image, x0 + 1, y0);
    let p01 = pixel_or_black(image, x0, y0 + 1);
    let p11 = pixel_or_black(image, x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let a = p00[c] + fx * (p10[c] - p00[c]);
        let b = p01[c] + fx * (p11[c] - p01[c]);
        out[c] = (a + fy * (b - a)).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f32, y: f32) -> Point2<f32> {
        Point2::new(x, y)
    }

    fn assert_close(a: Point2<f32>, b: Point2<f32>, tol: f32) {
        assert!(
            (a.x - b.x).abs() < tol && (a.y - b.y).abs() < tol,
            "expected ({:.4},{:.4}) ~ ({:.4},{:.4})",
            a.x,
            a.y,
            b.x,
            b.y
        );
    }

    #[test]
    fn order_points_handles_any_input_order() {
        let expected = [pt(10.0, 10.0), pt(90.0, 12.0), pt(88.0, 95.0), pt(8.0, 90.0)];
        let shuffled = [expected[2], expected[0], expected[3], expected[1]];
        assert_eq!(order_points(&shuffled), expected);
    }

    #[test]
    fn four_point_homography_maps_corners() {
        let src = [pt(0.0, 0.0), pt(99.0, 0.0), pt(99.0, 49.0), pt(0.0, 49.0)];
        let dst = [pt(12.0, 7.0), pt(130.0, 20.0), pt(120.0, 90.0), pt(5.0, 70.0)];
        let h = Homography::from_4pt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(dst.iter()) {
            assert_close(h.apply(*s), *d, 1e-3);
        }
    }

    #[test]
    fn collinear_points_are_singular() {
        let src = [pt(0.0, 0.0), pt(1.0, 0.0), pt(2.0, 0.0), pt(3.0, 0.0)];
        let dst = [pt(0.0, 0.0), pt(1.0, 1.0), pt(2.0, 2.0), pt(3.0, 3.0)];
        assert!(Homography::from_4pt(&src, &dst).is_none());
    }

    #[test]
    fn axis_aligned_square_is_cropped() {
        // Red square at [20, 60) x [30, 70) on a blue background.
        let image = RgbImage::from_fn(100, 100, |x, y| {
            if (20..60).contains(&x) && (30..70).contains(&y) {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let corners = [pt(59.0, 30.0), pt(20.0, 30.0), pt(20.0, 69.0), pt(59.0, 69.0)];
        let out = four_point_transform(&image, &corners).unwrap();
        assert_eq!(out.dimensions(), (39, 39));
        assert!(out.pixels().all(|p| *p == Rgb([255, 0, 0])));
    }

    #[test]
    fn rotated_quad_has_expected_size() {
        let image = RgbImage::from_pixel(200, 200, Rgb([0, 200, 0]));
        // A 50-pixel square rotated by 45 degrees around (100, 100).
        let r = 50.0 / 2f32.sqrt();
        let corners = [
            pt(100.0, 100.0 - r),
            pt(100.0 + r, 100.0),
            pt(100.0, 100.0 + r),
            pt(100.0 - r, 100.0),
        ];
        let out = four_point_transform(&image, &corners).unwrap();
        let (w, h) = out.dimensions();
        assert!((49..=50).contains(&w) && (49..=50).contains(&h), "{w}x{h}");
        assert_eq!(*out.get_pixel(w / 2, h / 2), Rgb([0, 200, 0]));
    }

    #[test]
    fn collapsed_quad_is_degenerate() {
        let image = RgbImage::new(10, 10);
        let corners = [pt(5.0, 5.0); 4];
        assert!(matches!(
            four_point_transform(&image, &corners),
            Err(RectifyError::Degenerate { .. })
        ));
    }

    #[test]
    fn outside_samples_are_black() {
        let image = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        assert_eq!(sample_bilinear(&image, -5.0, -5.0), Rgb([0, 0, 0]));
        assert_eq!(sample_bilinear(&image, 1.0, 1.0), Rgb([255, 255, 255]));
    }
}
