//! Multi-octave Harris corner detection.
//!
//! Corners are detected on a pyramid of halved resolutions, refined to
//! sub-pixel precision, mapped back to full-resolution coordinates and
//! deduplicated against coarser octaves. Cameras with a cut FOV contribute an
//! image-circle mask so the fisheye border does not spawn corners.

use std::collections::BTreeMap;
use std::time::Instant;

use image::imageops::{self, FilterType};
use image::GrayImage;
use log::{debug, info};

use rigcal_core::{
    Camera, CalibrationConfig, CalibrationError, DetectorConfig, Real, Result, Rig, Vec2,
};

use crate::corner::{pixel_bilinear, Corner};

/// Refinement starts from this unlikely offset; a result still equal to the
/// start means refinement silently failed and the corner is dropped.
const REFINE_OFFSET: Vec2 = Vec2::new(0.0017, 0.0013);

/// 255 inside the camera's image circle, 0 outside.
pub fn image_circle_mask(camera: &Camera) -> GrayImage {
    let (w, h) = (camera.resolution.x as u32, camera.resolution.y as u32);
    GrayImage::from_fn(w, h, |x, y| {
        let pixel = Vec2::new(x as Real + 0.5, y as Real + 0.5);
        image::Luma([if camera.is_outside_image_circle(&pixel) { 0 } else { 255 }])
    })
}

fn resized(img: &GrayImage, scale: Real) -> GrayImage {
    let w = (img.width() as Real * scale).round().max(1.0) as u32;
    let h = (img.height() as Real * scale).round().max(1.0) as u32;
    imageops::resize(img, w, h, FilterType::Triangle)
}

/// Harris corner responses thresholded, non-max suppressed and thinned to a
/// minimum mutual distance, strongest first. Returns integer coordinates.
fn harris_corners(
    gray: &GrayImage,
    mask: Option<&GrayImage>,
    cfg: &DetectorConfig,
) -> Vec<(usize, usize)> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let r = cfg.harris_window_radius;
    if w <= 2 * r + 2 || h <= 2 * r + 2 {
        return Vec::new();
    }

    let pixel = |x: usize, y: usize| gray.as_raw()[y * w + x] as Real;

    // Sobel gradients and their products
    let mut ixx = vec![0.0; w * h];
    let mut iyy = vec![0.0; w * h];
    let mut ixy = vec![0.0; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (pixel(x + 1, y - 1) + 2.0 * pixel(x + 1, y) + pixel(x + 1, y + 1))
                - (pixel(x - 1, y - 1) + 2.0 * pixel(x - 1, y) + pixel(x - 1, y + 1));
            let gy = (pixel(x - 1, y + 1) + 2.0 * pixel(x, y + 1) + pixel(x + 1, y + 1))
                - (pixel(x - 1, y - 1) + 2.0 * pixel(x, y - 1) + pixel(x + 1, y - 1));
            ixx[y * w + x] = gx * gx;
            iyy[y * w + x] = gy * gy;
            ixy[y * w + x] = gx * gy;
        }
    }

    // integral images for box sums over the response window
    let integral = |src: &[Real]| {
        let mut out = vec![0.0; (w + 1) * (h + 1)];
        for y in 0..h {
            let mut row = 0.0;
            for x in 0..w {
                row += src[y * w + x];
                out[(y + 1) * (w + 1) + (x + 1)] = out[y * (w + 1) + (x + 1)] + row;
            }
        }
        out
    };
    let (sxx, syy, sxy) = (integral(&ixx), integral(&iyy), integral(&ixy));
    let box_sum = |s: &[Real], x: usize, y: usize| {
        let (x0, y0, x1, y1) = (x - r, y - r, x + r + 1, y + r + 1);
        s[y1 * (w + 1) + x1] - s[y0 * (w + 1) + x1] - s[y1 * (w + 1) + x0]
            + s[y0 * (w + 1) + x0]
    };

    let masked_out =
        |x: usize, y: usize| mask.is_some_and(|m| m.as_raw()[y * m.width() as usize + x] < 128);

    // Harris response, only where the window fits
    let mut response = vec![Real::NEG_INFINITY; w * h];
    let mut max_response: Real = 0.0;
    for y in r + 1..h - r - 1 {
        for x in r + 1..w - r - 1 {
            if masked_out(x, y) {
                continue;
            }
            let (a, c, b) = (box_sum(&sxx, x, y), box_sum(&syy, x, y), box_sum(&sxy, x, y));
            let score = (a * c - b * b) - cfg.harris_k * (a + c) * (a + c);
            response[y * w + x] = score;
            max_response = max_response.max(score);
        }
    }
    if max_response <= 0.0 {
        return Vec::new();
    }

    // threshold and 3x3 non-max suppression
    let threshold = cfg.min_feature_quality * max_response;
    let mut candidates = Vec::new();
    for y in r + 1..h - r - 1 {
        for x in r + 1..w - r - 1 {
            let score = response[y * w + x];
            if score < threshold {
                continue;
            }
            let mut is_max = true;
            'nms: for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if (dx, dy) == (0, 0) {
                        continue;
                    }
                    let nx = (x as i64 + dx) as usize;
                    let ny = (y as i64 + dy) as usize;
                    if response[ny * w + nx] > score {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                candidates.push((score, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    // greedy minimum-distance thinning on a coarse grid
    let min_dist = cfg.min_feature_distance;
    let cell = min_dist.max(1.0);
    let cells_x = (w as Real / cell).ceil() as usize + 1;
    let cells_y = (h as Real / cell).ceil() as usize + 1;
    let mut grid: Vec<Vec<(usize, usize)>> = vec![Vec::new(); cells_x * cells_y];
    let mut corners = Vec::new();
    for (_, x, y) in candidates {
        let cx = (x as Real / cell) as usize;
        let cy = (y as Real / cell) as usize;
        let mut too_close = false;
        'search: for ny in cy.saturating_sub(1)..=(cy + 1).min(cells_y - 1) {
            for nx in cx.saturating_sub(1)..=(cx + 1).min(cells_x - 1) {
                for &(ox, oy) in &grid[ny * cells_x + nx] {
                    let dx = ox as Real - x as Real;
                    let dy = oy as Real - y as Real;
                    if dx * dx + dy * dy < min_dist * min_dist {
                        too_close = true;
                        break 'search;
                    }
                }
            }
        }
        if too_close {
            continue;
        }
        grid[cy * cells_x + cx].push((x, y));
        corners.push((x, y));
        if corners.len() >= cfg.max_corners {
            break;
        }
    }
    corners
}

/// Iterative gradient-weighted centroid refinement. Stops once the update
/// falls below `epsilon`; a near-singular system leaves the input untouched.
fn refine_subpixel(img: &GrayImage, start: &Vec2, cfg: &DetectorConfig) -> Vec2 {
    const MAX_ITERATIONS: usize = 100;
    let r = cfg.refine_radius as i64;
    let sigma = (cfg.refine_radius as Real / 2.0).max(1.0);

    let mut center = *start;
    for _ in 0..MAX_ITERATIONS {
        let mut a = 0.0;
        let mut b = 0.0;
        let mut c = 0.0;
        let mut bx = 0.0;
        let mut by = 0.0;
        for dy in -r..=r {
            for dx in -r..=r {
                let weight =
                    (-((dx * dx + dy * dy) as Real) / (2.0 * sigma * sigma)).exp();
                let x = center.x + dx as Real;
                let y = center.y + dy as Real;
                let gx = (pixel_bilinear(img, x + 1.0, y) - pixel_bilinear(img, x - 1.0, y)) / 2.0;
                let gy = (pixel_bilinear(img, x, y + 1.0) - pixel_bilinear(img, x, y - 1.0)) / 2.0;
                a += weight * gx * gx;
                b += weight * gx * gy;
                c += weight * gy * gy;
                bx += weight * (gx * gx * dx as Real + gx * gy * dy as Real);
                by += weight * (gx * gy * dx as Real + gy * gy * dy as Real);
            }
        }
        let det = a * c - b * b;
        if det.abs() < 1e-12 {
            break;
        }
        let shift = Vec2::new((c * bx - b * by) / det, (a * by - b * bx) / det);
        center += shift;
        if shift.norm() < cfg.refine_epsilon {
            break;
        }
    }
    center
}

/// Detect and refine corners at one pyramid scale, in full-resolution
/// pixel-center coordinates.
pub fn find_scaled_corners(
    scale: Real,
    image_full: &GrayImage,
    mask_full: Option<&GrayImage>,
    cfg: &DetectorConfig,
) -> Vec<Vec2> {
    let gray;
    let gray = if scale == 1.0 {
        image_full
    } else {
        gray = resized(image_full, scale);
        &gray
    };
    let mask;
    let mask = match mask_full {
        Some(m) if scale != 1.0 => {
            mask = resized(m, scale);
            Some(&mask)
        }
        other => other,
    };

    let mut corners = Vec::new();
    for (x, y) in harris_corners(gray, mask, cfg) {
        let start = Vec2::new(x as Real, y as Real) + REFINE_OFFSET;
        let refined = refine_subpixel(gray, &start, cfg);
        // refinement that failed to move is a silent failure
        if refined != start {
            corners.push(Vec2::new(
                (refined.x + 0.5) / scale,
                (refined.y + 0.5) / scale,
            ));
        }
    }
    corners
}

fn is_close_to_edge(point: &Vec2, img: &GrayImage, margin: Real) -> bool {
    !(point.x - margin >= 0.0
        && point.x + margin < img.width() as Real
        && point.y - margin >= 0.0
        && point.y + margin < img.height() as Real)
}

fn is_unique_corner(corners: &[Corner], previous_count: usize, corner: &Vec2, radius: Real) -> bool {
    if radius <= 0.0 {
        return true;
    }
    corners[..previous_count]
        .iter()
        .all(|previous| (previous.coords - corner).norm() >= radius)
}

/// Detect corners for one camera across all octaves.
pub fn find_corners(camera: &Camera, image: &GrayImage, cfg: &DetectorConfig) -> Vec<Corner> {
    info!("Processing camera {}...", camera.id);

    let mask = (!camera.is_default_fov()).then(|| image_circle_mask(camera));

    let mut corners: Vec<Corner> = Vec::new();
    let mut rejected = 0;
    let mut deduplicated = 0;
    for octave in 0..cfg.octave_count {
        let scale = 0.5_f64.powi(octave as i32);
        let octave_corners = find_scaled_corners(scale, image, mask.as_ref(), cfg);
        debug!(
            "{} found {} corners at scale {}",
            camera.id,
            octave_corners.len(),
            scale
        );
        let count_before_octave = corners.len();
        for corner in octave_corners {
            if is_close_to_edge(&corner, image, cfg.zncc_window_radius as Real) {
                rejected += 1;
            } else if !is_unique_corner(
                &corners,
                count_before_octave,
                &corner,
                cfg.deduplicate_radius,
            ) {
                deduplicated += 1;
            } else {
                corners.push(Corner::new(
                    corner,
                    image,
                    cfg.zncc_window_radius,
                    cfg.use_nearest,
                ));
            }
        }
    }

    info!(
        "{} accepted corners: {} deduplicated corners: {} rejected corners: {}",
        camera.id,
        corners.len(),
        deduplicated,
        rejected
    );
    corners
}

/// Detect corners for every camera, in parallel per the thread settings.
/// The result maps camera ids to their corners.
pub fn find_all_corners(
    rig: &Rig,
    images: &[GrayImage],
    config: &CalibrationConfig,
) -> Result<BTreeMap<String, Vec<Corner>>> {
    let timer = Instant::now();
    let threads = config.threads.detect;

    let detected: Vec<(String, Vec<Corner>)> = if threads == 1 {
        rig.iter()
            .zip(images)
            .map(|(camera, image)| (camera.id.clone(), find_corners(camera, image, &config.detector)))
            .collect()
    } else {
        use rayon::prelude::*;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| CalibrationError::Config(format!("thread pool: {e}")))?;
        pool.install(|| {
            rig.par_iter()
                .zip(images)
                .map(|(camera, image)| {
                    (camera.id.clone(), find_corners(camera, image, &config.detector))
                })
                .collect()
        })
    };

    if config.enable_timing {
        info!("Find corners stage time: {:.3}s", timer.elapsed().as_secs_f64());
    }
    Ok(detected.into_iter().collect())
}

/// Fail when any camera produced fewer corners than the hard minimum.
pub fn validate_feature_counts(
    all_corners: &BTreeMap<String, Vec<Corner>>,
    min_features: usize,
) -> Result<()> {
    for (camera, corners) in all_corners {
        if corners.len() < min_features {
            return Err(CalibrationError::InsufficientFeatures {
                camera: camera.clone(),
                found: corners.len(),
                needed: min_features,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use rigcal_core::Projection;

    /// Dark background with one bright square; its four corners are the only
    /// strong Harris responses.
    fn square_image(size: u32, lo: u32, hi: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            Luma([if (lo..hi).contains(&x) && (lo..hi).contains(&y) { 220 } else { 30 }])
        })
    }

    fn relaxed_config() -> DetectorConfig {
        DetectorConfig {
            octave_count: 1,
            min_features: 0,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn finds_square_corners() {
        let img = square_image(128, 40, 90);
        let corners = find_scaled_corners(1.0, &img, None, &relaxed_config());
        assert_eq!(corners.len(), 4, "corners: {corners:?}");
        // pixel-center coordinates put the intensity edges at 40.0 and 90.0
        for expected in [
            Vec2::new(40.0, 40.0),
            Vec2::new(90.0, 40.0),
            Vec2::new(40.0, 90.0),
            Vec2::new(90.0, 90.0),
        ] {
            assert!(
                corners.iter().any(|c| (c - expected).norm() < 1.5),
                "no corner near {expected:?} in {corners:?}"
            );
        }
    }

    #[test]
    fn min_distance_is_respected() {
        let img = square_image(128, 40, 90);
        let cfg = relaxed_config();
        let corners = find_scaled_corners(1.0, &img, None, &cfg);
        for (i, a) in corners.iter().enumerate() {
            for b in &corners[i + 1..] {
                assert!((a - b).norm() >= cfg.min_feature_distance);
            }
        }
    }

    #[test]
    fn octaves_deduplicate() {
        let img = square_image(256, 80, 180);
        let mut camera = Camera::new(
            Projection::Rectilinear,
            Vec2::new(256.0, 256.0),
            Vec2::new(200.0, -200.0),
        );
        camera.id = "cam".to_string();
        let cfg = DetectorConfig {
            octave_count: 2,
            min_features: 0,
            ..DetectorConfig::default()
        };
        let corners = find_corners(&camera, &img, &cfg);
        // the second octave re-finds the same four corners; dedup eats them
        assert_eq!(corners.len(), 4, "corners: {:?}", corners.iter().map(|c| c.coords).collect::<Vec<_>>());
    }

    #[test]
    fn masked_region_has_no_corners() {
        let img = square_image(128, 40, 90);
        // mask away the left half, removing the two left corners
        let mask = GrayImage::from_fn(128, 128, |x, _| Luma([if x < 64 { 0 } else { 255 }]));
        let corners = find_scaled_corners(1.0, &img, Some(&mask), &relaxed_config());
        assert!(corners.iter().all(|c| c.x >= 64.0), "corners: {corners:?}");
    }

    #[test]
    fn too_few_features_is_fatal() {
        let mut all = BTreeMap::new();
        all.insert("cam3".to_string(), Vec::new());
        let err = validate_feature_counts(&all, 10).unwrap_err();
        match err {
            CalibrationError::InsufficientFeatures { camera, found, needed } => {
                assert_eq!(camera, "cam3");
                assert_eq!(found, 0);
                assert_eq!(needed, 10);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
