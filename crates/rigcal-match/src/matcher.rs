//! Disparity-swept ZNCC patch matching.
//!
//! For each corner in one camera the matcher sweeps candidate disparities
//! between the configured depth bounds, reprojects the corner's neighborhood
//! into the other camera, and scores candidate corners inside a search box
//! with ZNCC. A pair is kept only when both corners are each other's best
//! match and the best score is both strong and unambiguous.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use image::GrayImage;
use log::info;

use rigcal_core::{
    Camera, CalibrationConfig, CalibrationError, ImageId, MatcherConfig, Real, Result, Rig, Vec2,
};

use crate::corner::{pixel_bilinear, pixel_nearest, zncc, Corner, Patch};
use crate::detector::find_scaled_corners;

/// A pair of corner indices and the ZNCC score that matched them.
#[derive(Clone, Copy, Debug)]
pub struct Match {
    pub score: Real,
    pub corners: [usize; 2],
}

/// All matches between one pair of images.
#[derive(Clone, Debug)]
pub struct Overlap {
    pub images: [ImageId; 2],
    pub matches: Vec<Match>,
}

impl Overlap {
    pub fn new(image0: ImageId, image1: ImageId) -> Self {
        Overlap {
            images: [image0, image1],
            matches: Vec::new(),
        }
    }

    /// Matches are only meaningful between images of the same frame.
    pub fn is_intra_frame(&self, layout: rigcal_core::RigLayout) -> bool {
        self.images[0].frame_index(layout) == self.images[1].frame_index(layout)
    }
}

/// Best and second-best candidate for one corner. Scores start at the -1
/// sentinel, below any real ZNCC score; a corner that never found a second
/// candidate therefore always passes the ambiguity margin.
#[derive(Clone, Debug)]
struct BestMatch {
    best: Option<usize>,
    best_score: Real,
    second: Option<usize>,
    second_score: Real,
}

impl Default for BestMatch {
    fn default() -> Self {
        BestMatch {
            best: None,
            best_score: -1.0,
            second: None,
            second_score: -1.0,
        }
    }
}

impl BestMatch {
    fn update(&mut self, score: Real, idx: usize) {
        if score > self.best_score {
            if self.best == Some(idx) {
                // same candidate scored better at another disparity
                self.best_score = score;
            } else {
                self.second = self.best;
                self.second_score = self.best_score;
                self.best = Some(idx);
                self.best_score = score;
            }
        } else if score > self.second_score && self.best != Some(idx) {
            self.second = Some(idx);
            self.second_score = score;
        }
    }

    /// Weak corners are rejected: the best score is below the threshold, or
    /// the two best candidates are nearly indistinguishable.
    fn is_weak(&self, cfg: &MatcherConfig) -> bool {
        self.best_score < cfg.match_score_threshold
            || self.best_score - self.second_score < cfg.zncc_delta_threshold
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct SearchBox {
    x: Real,
    y: Real,
    w: Real,
    h: Real,
}

impl SearchBox {
    fn area(&self) -> Real {
        self.w * self.h
    }

    fn intersection_area(&self, other: &SearchBox) -> Real {
        let w = (self.x + self.w).min(other.x + other.w) - self.x.max(other.x);
        let h = (self.y + self.h).min(other.y + other.h) - self.y.max(other.y);
        if w > 0.0 && h > 0.0 {
            w * h
        } else {
            0.0
        }
    }

    fn contains(&self, p: &Vec2) -> bool {
        self.x <= p.x && p.x < self.x + self.w && self.y <= p.y && p.y < self.y + self.h
    }
}

/// Search box in `camera1` around the projection of `pixel0` at `depth`.
fn compute_box(
    camera1: &Camera,
    camera0: &Camera,
    pixel0: &Vec2,
    depth: Real,
    search_radius: Real,
) -> SearchBox {
    let world = camera0.rig_at_depth(pixel0, depth);
    let pixel1 = camera1.pixel(&world);
    SearchBox {
        x: pixel1.x - search_radius,
        y: pixel1.y - search_radius,
        w: 2.0 * search_radius,
        h: 2.0 * search_radius,
    }
}

fn too_much_overlap(b: &SearchBox, last: &SearchBox, search_overlap: Real) -> bool {
    b.intersection_area(last) > search_overlap * b.area()
}

/// Advance the sweep to the next disparity whose search box is substantially
/// different from the current one.
fn next_depth_sample(
    sample: &mut i64,
    disparity: &mut Real,
    current_box: &mut SearchBox,
    camera0: &Camera,
    corner0_coords: &Vec2,
    camera1: &Camera,
    cfg: &MatcherConfig,
) -> bool {
    let min_disparity = 1.0 / cfg.depth_max;
    let max_disparity = 1.0 / cfg.depth_min;
    for next in (*sample + 1)..cfg.depth_samples as i64 {
        let t = next as Real / (cfg.depth_samples - 1) as Real;
        let next_disparity = min_disparity + (max_disparity - min_disparity) * t;
        let next_box = compute_box(
            camera1,
            camera0,
            corner0_coords,
            1.0 / next_disparity,
            cfg.search_radius,
        );
        if !too_much_overlap(&next_box, current_box, cfg.search_overlap) {
            *sample = next;
            *disparity = next_disparity;
            *current_box = next_box;
            return true;
        }
    }
    false
}

/// Compute what the neighborhood of a corner in `camera0` looks like from
/// `camera1`: project the corner at `depth0`, then read back each pixel of a
/// square around the projection from `camera0`'s image. Fails when either
/// camera cannot see a required point.
fn project_corner(
    camera1: &Camera,
    img0: &GrayImage,
    camera0: &Camera,
    corner0: &Corner,
    depth0: Real,
    use_nearest: bool,
) -> Option<GrayImage> {
    let corner = camera0.rig_at_depth(&corner0.coords, depth0);
    let corner1 = camera1.sees(&corner)?;
    let depth1 = (corner - camera1.position).norm();

    let radius = (corner0.patch.side() / 2) as i64;
    let side = (2 * radius + 1) as u32;
    let mut projection = GrayImage::new(side, side);
    for y_offset in -radius..=radius {
        for x_offset in -radius..=radius {
            let pixel1 = Vec2::new(
                corner1.x + x_offset as Real,
                corner1.y + y_offset as Real,
            );
            let world = camera1.rig_at_depth(&pixel1, depth1);
            let pixel0 = camera0.sees(&world)?;
            let value = if use_nearest {
                pixel_nearest(img0, pixel0.x, pixel0.y)
            } else {
                pixel_bilinear(img0, pixel0.x, pixel0.y)
            };
            projection.put_pixel(
                (x_offset + radius) as u32,
                (y_offset + radius) as u32,
                image::Luma([value.round() as u8]),
            );
        }
    }
    Some(projection)
}

/// Re-detect corners in a reprojected patch and require one close to the
/// center; reprojection through bad geometry smears the corner away.
fn has_corner_near_center(image: &GrayImage, config: &CalibrationConfig) -> bool {
    let center = 0.5 * Vec2::new(image.width() as Real, image.height() as Real);
    let mut best = center;
    for corner in find_scaled_corners(1.0, image, None, &config.detector) {
        let offset = corner - center;
        if offset.norm_squared() < best.norm_squared() {
            best = offset;
        }
    }
    best.norm_squared() <= config.matcher.drift_tolerance * config.matcher.drift_tolerance
}

/// Match corners between one image pair.
pub fn find_matches(
    img0: &GrayImage,
    corners0: &[Corner],
    camera0: &Camera,
    corners1: &[Corner],
    camera1: &Camera,
    config: &CalibrationConfig,
) -> Overlap {
    let cfg = &config.matcher;
    let single_threaded = config.threads.matching <= 1;
    let timer = Instant::now();
    let mut zncc_time = Duration::ZERO;
    let mut project_time = Duration::ZERO;
    let mut calls_to_zncc = 0u64;
    let mut calls_to_project = 0u64;

    let mut best0: Vec<BestMatch> = vec![BestMatch::default(); corners0.len()];
    let mut best1: Vec<BestMatch> = vec![BestMatch::default(); corners1.len()];

    for (index0, corner0) in corners0.iter().enumerate() {
        if single_threaded && index0 % 1000 == 0 {
            info!(
                "Processing feature {} of {} from pair {} {}",
                index0,
                corners0.len(),
                camera0.id,
                camera1.id
            );
        }

        let mut sample = -1i64;
        let mut disparity = 0.0;
        let mut box1 = SearchBox::default();
        let mut first_projection = true;
        let mut projection1: Option<Patch> = None;
        while next_depth_sample(
            &mut sample,
            &mut disparity,
            &mut box1,
            camera0,
            &corner0.coords,
            camera1,
            cfg,
        ) {
            // only remap the patch for sufficiently large disparities
            if first_projection || disparity > 1.0 / cfg.max_depth_for_remap {
                let project_start = Instant::now();
                calls_to_project += 1;
                let projected = project_corner(
                    camera1,
                    img0,
                    camera0,
                    corner0,
                    1.0 / disparity,
                    config.detector.use_nearest,
                );
                project_time += project_start.elapsed();
                let Some(image1) = projected else {
                    continue;
                };

                // don't match if the corner can't be rediscovered after
                // reprojection
                if !has_corner_near_center(&image1, config) {
                    continue;
                }
                projection1 = Some(Patch::from_data(
                    image1.width() as usize,
                    image1.as_raw().iter().map(|&v| v as Real).collect(),
                ));
                first_projection = false;
            }
            let Some(projection1) = projection1.as_ref() else {
                continue;
            };

            // look for a corner in camera1 that is in the box and looks alike
            let zncc_start = Instant::now();
            for (index1, corner1) in corners1.iter().enumerate() {
                if !box1.contains(&corner1.coords) {
                    continue;
                }
                let score = zncc(projection1, &corner1.patch, cfg.custom_zncc);
                best0[index0].update(score, index1);
                best1[index1].update(score, index0);
                calls_to_zncc += 1;
            }
            zncc_time += zncc_start.elapsed();
        }
    }

    // take a match only if both ends are strong and each other's best
    let mut overlap = Overlap::new(
        ImageId::new(camera0.id.clone()),
        ImageId::new(camera1.id.clone()),
    );
    for (index0, match0) in best0.iter().enumerate() {
        if match0.is_weak(cfg) {
            continue;
        }
        let Some(best_idx1) = match0.best else {
            continue;
        };
        let match1 = &best1[best_idx1];
        if match1.is_weak(cfg) {
            continue;
        }
        if match1.best != Some(index0) {
            continue;
        }
        overlap.matches.push(Match {
            score: match0.best_score,
            corners: [index0, best_idx1],
        });
    }

    // timers from parallel runs would include other threads' work
    if config.enable_timing && single_threaded {
        info!(
            "{} and {} matching complete. Overlap fraction: {:.3}. Matches: {}. \
             Time: {:.3}s. Calls to ZNCC: {}. ZNCC time: {:.3}s. \
             Calls to project corner: {}. Project corner time: {:.3}s",
            camera0.id,
            camera1.id,
            camera0.overlap(camera1),
            overlap.matches.len(),
            timer.elapsed().as_secs_f64(),
            calls_to_zncc,
            zncc_time.as_secs_f64(),
            calls_to_project,
            project_time.as_secs_f64()
        );
    } else {
        info!(
            "{} and {} matching complete. Overlap fraction: {:.3}. Matches: {}",
            camera0.id,
            camera1.id,
            camera0.overlap(camera1),
            overlap.matches.len()
        );
    }
    overlap
}

/// Match every sufficiently overlapping camera pair, in parallel per the
/// thread settings. Corners are looked up by camera id.
pub fn find_all_matches(
    rig: &Rig,
    images: &[GrayImage],
    all_corners: &BTreeMap<String, Vec<Corner>>,
    config: &CalibrationConfig,
) -> Result<Vec<Overlap>> {
    let timer = Instant::now();

    let mut pairs = Vec::new();
    for c1 in 0..rig.len() {
        for c2 in c1 + 1..rig.len() {
            if rig[c1].overlap(&rig[c2]) < config.matcher.overlap_threshold {
                continue;
            }
            pairs.push((c1, c2));
        }
    }
    for &(c1, c2) in &pairs {
        for c in [c1, c2] {
            if !all_corners.contains_key(&rig[c].id) {
                return Err(CalibrationError::InvariantViolation(format!(
                    "no corners for camera {}",
                    rig[c].id
                )));
            }
        }
    }

    let run = |&(c1, c2): &(usize, usize)| {
        find_matches(
            &images[c1],
            &all_corners[&rig[c1].id],
            &rig[c1],
            &all_corners[&rig[c2].id],
            &rig[c2],
            config,
        )
    };

    let threads = config.threads.matching;
    let overlaps = if threads == 1 {
        pairs.iter().map(run).collect()
    } else {
        use rayon::prelude::*;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| CalibrationError::Config(format!("thread pool: {e}")))?;
        pool.install(|| pairs.par_iter().map(run).collect())
    };

    if config.enable_timing {
        info!("Matching stage time: {:.3}s", timer.elapsed().as_secs_f64());
    }
    Ok(overlaps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigcal_core::{MatcherConfig, Projection, Vec3};

    #[test]
    fn best_match_bookkeeping() {
        let mut best = BestMatch::default();
        best.update(0.5, 3);
        best.update(0.8, 7);
        assert_eq!(best.best, Some(7));
        assert_eq!(best.second, Some(3));
        // same index improving does not displace the second best
        best.update(0.9, 7);
        assert_eq!(best.best, Some(7));
        assert_eq!(best.second, Some(3));
        assert_eq!(best.second_score, 0.5);
        // a new index in between becomes the second best
        best.update(0.6, 1);
        assert_eq!(best.second, Some(1));
    }

    #[test]
    fn missing_second_best_passes_margin() {
        let cfg = MatcherConfig::default();
        let mut best = BestMatch::default();
        best.update(0.9, 0);
        // second best is the -1 sentinel, margin 1.9 passes easily
        assert!(!best.is_weak(&cfg));
        let mut ambiguous = BestMatch::default();
        ambiguous.update(0.9, 0);
        ambiguous.update(0.89, 1);
        assert!(ambiguous.is_weak(&cfg));
        let mut low = BestMatch::default();
        low.update(0.4, 0);
        assert!(low.is_weak(&cfg));
    }

    #[test]
    fn search_box_overlap() {
        let a = SearchBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 };
        let b = SearchBox { x: 5.0, y: 0.0, w: 10.0, h: 10.0 };
        let c = SearchBox { x: 20.0, y: 20.0, w: 10.0, h: 10.0 };
        assert!(too_much_overlap(&a, &b, 0.25));
        assert!(!too_much_overlap(&a, &c, 0.25));
        assert!(a.contains(&Vec2::new(9.9, 0.0)));
        assert!(!a.contains(&Vec2::new(10.0, 0.0)));
    }

    #[test]
    fn depth_sweep_spans_disparity_range() {
        let cfg = MatcherConfig {
            search_overlap: 1.0, // accept every sample
            depth_samples: 10,
            ..MatcherConfig::default()
        };
        let mut camera0 = Camera::new(
            Projection::Rectilinear,
            Vec2::new(640.0, 480.0),
            Vec2::new(500.0, -500.0),
        );
        camera0.position = Vec3::new(-0.5, 0.0, 0.0);
        let camera1 = {
            let mut c = camera0.clone();
            c.position = Vec3::new(0.5, 0.0, 0.0);
            c
        };

        let mut sample = -1i64;
        let mut disparity = 0.0;
        let mut current = SearchBox::default();
        let coords = Vec2::new(320.0, 240.0);
        let mut disparities = Vec::new();
        while next_depth_sample(
            &mut sample,
            &mut disparity,
            &mut current,
            &camera0,
            &coords,
            &camera1,
            &cfg,
        ) {
            disparities.push(disparity);
        }
        assert_eq!(disparities.len(), 10);
        assert!((disparities[0] - 1.0 / cfg.depth_max).abs() < 1e-12);
        assert!((disparities[9] - 1.0 / cfg.depth_min).abs() < 1e-12);
        assert!(disparities.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn overlapping_boxes_are_skipped() {
        let cfg = MatcherConfig::default();
        let mut camera0 = Camera::new(
            Projection::Rectilinear,
            Vec2::new(640.0, 480.0),
            Vec2::new(500.0, -500.0),
        );
        camera0.position = Vec3::new(-0.5, 0.0, 0.0);
        let camera1 = {
            let mut c = camera0.clone();
            c.position = Vec3::new(0.5, 0.0, 0.0);
            c
        };

        let mut sample = -1i64;
        let mut disparity = 0.0;
        let mut current = SearchBox::default();
        let coords = Vec2::new(320.0, 240.0);
        let mut boxes = Vec::new();
        while next_depth_sample(
            &mut sample,
            &mut disparity,
            &mut current,
            &camera0,
            &coords,
            &camera1,
            &cfg,
        ) {
            boxes.push(current);
        }
        assert!(boxes.len() < cfg.depth_samples);
        for pair in boxes.windows(2) {
            assert!(!too_much_overlap(&pair[1], &pair[0], cfg.search_overlap));
        }
    }
}
