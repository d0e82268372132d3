//! Matching a camera's corners against an identical camera viewing the same
//! image must recover the identity correspondence with near-perfect scores.

use image::{GrayImage, Luma};
use rigcal_match::{find_corners, find_matches};
use rigcal_core::{Camera, CalibrationConfig, DetectorConfig, Projection, Vec2};

/// Deterministic high-frequency texture; corners everywhere.
fn noise_image(size: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| {
        let h = x
            .wrapping_mul(2654435761)
            .wrapping_add(y.wrapping_mul(2246822519))
            .wrapping_add(x.wrapping_mul(y).wrapping_mul(97));
        Luma([((h >> 8) & 0xff) as u8])
    })
}

fn camera(id: &str) -> Camera {
    let mut camera = Camera::new(
        Projection::Rectilinear,
        Vec2::new(256.0, 256.0),
        Vec2::new(220.0, -220.0),
    );
    camera.id = id.to_string();
    camera
}

#[test]
fn identical_views_self_match() {
    let config = CalibrationConfig {
        detector: DetectorConfig {
            octave_count: 1,
            min_features: 0,
            ..DetectorConfig::default()
        },
        ..CalibrationConfig::default()
    };

    let image = noise_image(256);
    let camera0 = camera("cam0");
    let camera1 = camera("cam1");
    let corners = find_corners(&camera0, &image, &config.detector);
    assert!(
        corners.len() >= 20,
        "expected a rich corner set, got {}",
        corners.len()
    );

    let overlap = find_matches(&image, &corners, &camera0, &corners, &camera1, &config);

    assert!(
        overlap.matches.len() * 10 >= corners.len() * 9,
        "only {} of {} corners self-matched",
        overlap.matches.len(),
        corners.len()
    );
    for m in &overlap.matches {
        assert_eq!(
            m.corners[0], m.corners[1],
            "corner matched something other than itself"
        );
        assert!(
            m.score > 0.9,
            "self-match score {} unexpectedly low",
            m.score
        );
    }
}
