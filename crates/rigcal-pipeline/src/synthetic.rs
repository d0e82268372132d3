//! Artificial observations of a known rig.
//!
//! Experiments need observations with a known answer: world points are drawn
//! uniformly on directions and uniformly in disparity, projected through the
//! ground-truth cameras, and jittered with gaussian pixel noise. Every
//! camera pair seeing a point gets a match, so the downstream trace assembly
//! and refinement run exactly as they would on detected corners.

use std::f64::consts::{PI, TAU};

use log::info;
use rand::Rng;

use rigcal_core::{Camera, ExperimentConfig, ImageId, Real, RigLayout, Vec2, Vec3};
use rigcal_match::{Match, Overlap};
use rigcal_optim::{find_or_add_overlap, Feature, FeatureMap};

/// One sample of a zero-mean gaussian via the Box-Muller transform.
fn gaussian(rng: &mut impl Rng, stddev: Real) -> Real {
    let u1: Real = rng.random::<Real>().max(Real::MIN_POSITIVE);
    let u2: Real = rng.random();
    stddev * (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Fill `feature_map` and `overlaps` with noisy observations of random world
/// points, as seen by the ground-truth cameras. All observations carry frame
/// index 0. Directions are uniform on the sphere; distances are uniform in
/// disparity up to `1 / point_min_dist`, so a zero disparity draw lands the
/// point at infinity and no camera reports seeing it.
pub fn generate_artificial_points(
    feature_map: &mut FeatureMap,
    overlaps: &mut Vec<Overlap>,
    ground_truth: &[Camera],
    layout: RigLayout,
    config: &ExperimentConfig,
    rng: &mut impl Rng,
) {
    let mut observations = 0usize;
    for _ in 0..config.point_count {
        let longitude = rng.random_range(-PI..PI);
        let z: Real = rng.random_range(-1.0..1.0);
        let radius = (1.0 - z * z).sqrt();
        let direction = Vec3::new(radius * longitude.cos(), radius * longitude.sin(), z);
        let disparity = rng.random_range(0.0..1.0 / config.point_min_dist);
        let rig = direction / disparity;

        let mut seen: Vec<(ImageId, usize)> = Vec::new();
        for camera in ground_truth {
            if let Some(pixel) = camera.sees(&rig) {
                let noise = Vec2::new(
                    gaussian(rng, config.point_error_stddev),
                    gaussian(rng, config.point_error_stddev),
                );
                let image = ImageId::from_parts(layout, &camera.id, "0");
                let features = feature_map.entry(image.clone()).or_default();
                features.push(Feature {
                    position: pixel + noise,
                    trace: None,
                });
                seen.push((image, features.len() - 1));
            }
        }
        observations += seen.len();
        for second in 1..seen.len() {
            for first in 0..second {
                let overlap = find_or_add_overlap(overlaps, &seen[first].0, &seen[second].0);
                overlap.matches.push(Match {
                    score: 1.0,
                    corners: [seen[first].1, seen[second].1],
                });
            }
        }
    }
    info!(
        "generated {observations} observations of {} points",
        config.point_count
    );
}
