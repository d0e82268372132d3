//! Corners and their ZNCC patches.

use image::GrayImage;
use rigcal_core::{Real, Vec2};

/// Clamped bilinear sample of a grayscale image.
pub fn pixel_bilinear(img: &GrayImage, x: Real, y: Real) -> Real {
    let max_x = (img.width() - 1) as Real;
    let max_y = (img.height() - 1) as Real;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor();
    let y0 = y.floor();
    let x1 = (x0 + 1.0).min(max_x);
    let y1 = (y0 + 1.0).min(max_y);
    let fx = x - x0;
    let fy = y - y0;
    let at = |px: Real, py: Real| img.get_pixel(px as u32, py as u32).0[0] as Real;
    let top = (1.0 - fx) * at(x0, y0) + fx * at(x1, y0);
    let bottom = (1.0 - fx) * at(x0, y1) + fx * at(x1, y1);
    (1.0 - fy) * top + fy * bottom
}

/// Clamped nearest-neighbor sample, truncating like an integer cast.
pub fn pixel_nearest(img: &GrayImage, x: Real, y: Real) -> Real {
    let x = (x as i64).clamp(0, (img.width() - 1) as i64) as u32;
    let y = (y as i64).clamp(0, (img.height() - 1) as i64) as u32;
    img.get_pixel(x, y).0[0] as Real
}

/// Square intensity patch with precomputed mean and standard deviation.
#[derive(Clone, Debug)]
pub struct Patch {
    side: usize,
    data: Vec<Real>,
    pub mean: Real,
    pub stddev: Real,
}

impl Patch {
    /// Sample a `(2 radius + 1)²` patch centered on `coords`.
    pub fn sample(img: &GrayImage, coords: &Vec2, radius: usize, use_nearest: bool) -> Patch {
        let r = radius as i64;
        let side = 2 * radius + 1;
        let mut data = Vec::with_capacity(side * side);
        for y_offset in -r..=r {
            for x_offset in -r..=r {
                let x = coords.x + x_offset as Real;
                let y = coords.y + y_offset as Real;
                data.push(if use_nearest {
                    pixel_nearest(img, x, y)
                } else {
                    pixel_bilinear(img, x, y)
                });
            }
        }
        Patch::from_data(side, data)
    }

    /// Wrap an already-sampled square buffer.
    pub fn from_data(side: usize, data: Vec<Real>) -> Patch {
        debug_assert_eq!(data.len(), side * side);
        let n = data.len() as Real;
        let mean = data.iter().sum::<Real>() / n;
        let variance = data.iter().map(|v| (v - mean) * (v - mean)).sum::<Real>() / n;
        Patch {
            side,
            data,
            mean,
            stddev: variance.sqrt(),
        }
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn data(&self) -> &[Real] {
        &self.data
    }
}

/// A detected corner: sub-pixel image coordinates plus the matching patch.
#[derive(Clone, Debug)]
pub struct Corner {
    pub coords: Vec2,
    pub patch: Patch,
}

impl Corner {
    pub fn new(coords: Vec2, img: &GrayImage, radius: usize, use_nearest: bool) -> Corner {
        Corner {
            patch: Patch::sample(img, &coords, radius, use_nearest),
            coords,
        }
    }
}

/// Zero-normalized cross-correlation of two equally sized patches, in
/// `[-1, 1]`, higher is more similar.
///
/// The custom variant normalizes by the patch means and the larger relative
/// deviation instead of the two standard deviations.
pub fn zncc(a: &Patch, b: &Patch, custom: bool) -> Real {
    debug_assert_eq!(a.side, b.side);
    let mut sum = 0.0;
    for (pa, pb) in a.data.iter().zip(&b.data) {
        sum += (pa - a.mean) * (pb - b.mean);
    }

    let n = a.data.len() as Real;
    if custom {
        let numerator = sum / n / (a.mean * b.mean);
        let denominator = (a.stddev / a.mean).max(b.stddev / b.mean);
        numerator / (denominator * denominator)
    } else {
        sum / (a.stddev * b.stddev * n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Luma;

    fn gradient_image(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 7 + y * 13) % 251) as u8]))
    }

    #[test]
    fn bilinear_interpolates_between_pixels() {
        let img = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 0 } else { 100 }]));
        assert_relative_eq!(pixel_bilinear(&img, 0.5, 0.0), 50.0);
        // clamped outside the image
        assert_relative_eq!(pixel_bilinear(&img, -3.0, 0.0), 0.0);
        assert_relative_eq!(pixel_bilinear(&img, 5.0, 0.0), 100.0);
    }

    #[test]
    fn self_zncc_is_one() {
        let img = gradient_image(64, 64);
        let patch = Patch::sample(&img, &Vec2::new(32.0, 32.0), 16, false);
        assert_relative_eq!(zncc(&patch, &patch, false), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn zncc_detects_inversion() {
        let img = gradient_image(64, 64);
        let inverted = GrayImage::from_fn(64, 64, |x, y| {
            Luma([255 - img.get_pixel(x, y).0[0]])
        });
        let a = Patch::sample(&img, &Vec2::new(32.0, 32.0), 8, false);
        let b = Patch::sample(&inverted, &Vec2::new(32.0, 32.0), 8, false);
        assert_relative_eq!(zncc(&a, &b, false), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn patch_statistics() {
        let patch = Patch::from_data(2, vec![1.0, 2.0, 3.0, 4.0]);
        assert_relative_eq!(patch.mean, 2.5);
        assert_relative_eq!(patch.stddev, (1.25 as Real).sqrt());
    }
}
