//! A perturbed three-camera rig must be recovered from exact synthetic
//! observations by alternating triangulation and bundle adjustment passes.

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rigcal_core::{
    percentile, Camera, ImageId, Projection, RigIndex, RigLayout, SolveConfig, Vec2, Vec3,
};
use rigcal_optim::{solve_pass, triangulate_traces, Feature, FeatureMap, Trace};

fn camera(id: &str, position: Vec3) -> Camera {
    let mut camera = Camera::new(
        Projection::Rectilinear,
        Vec2::new(1600.0, 1200.0),
        Vec2::new(1000.0, -1000.0),
    );
    camera.id = id.to_string();
    camera.position = position;
    camera
}

fn ground_truth() -> Vec<Camera> {
    vec![
        camera("cam0", Vec3::new(0.0, 0.0, 0.0)),
        camera("cam1", Vec3::new(0.4, 0.0, 0.0)),
        camera("cam2", Vec3::new(0.0, 0.4, 0.0)),
    ]
}

fn world_points() -> Vec<Vec3> {
    let mut points = Vec::new();
    for &z in &[-4.0, -6.0, -8.0] {
        for xi in 0..5 {
            for yi in 0..5 {
                let x = -2.0 + xi as f64;
                let y = -1.5 + 0.75 * yi as f64;
                points.push(Vec3::new(x, y, z));
            }
        }
    }
    points
}

/// Observations of every point in every camera, as a feature map plus one
/// trace per point.
fn observe(cameras: &[Camera]) -> (FeatureMap, Vec<Trace>) {
    let mut feature_map = FeatureMap::new();
    let mut traces = Vec::new();
    for camera in cameras {
        feature_map.insert(ImageId::new(format!("{}/000000", camera.id)), Vec::new());
    }
    for point in world_points() {
        let mut trace = Trace::new();
        for camera in cameras {
            let pixel = camera.sees(&point).expect("point outside test rig view");
            let image = ImageId::new(format!("{}/000000", camera.id));
            let features = feature_map.get_mut(&image).unwrap();
            trace.add(image, features.len());
            features.push(Feature {
                position: pixel,
                trace: Some(traces.len()),
            });
        }
        trace.position = point;
        traces.push(trace);
    }
    (feature_map, traces)
}

#[test]
fn recovers_perturbed_rig() {
    let truth = ground_truth();
    let (feature_map, mut traces) = observe(&truth);

    let mut cameras = truth.clone();
    cameras[1].set_scaled_axis(&Vec3::new(0.004, -0.003, 0.002));
    cameras[2].set_scaled_axis(&Vec3::new(-0.003, 0.002, 0.004));
    cameras[2].position += Vec3::new(0.01, -0.005, 0.008);

    let rig_index = RigIndex::new(&cameras);
    let layout = RigLayout::DirPerCamera;
    let config = SolveConfig {
        lock_positions: false,
        lock_focals: true,
        lock_distortions: true,
        lock_principals: true,
        robust: false,
        min_traces: 10,
        ..SolveConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(0);

    let mut norms = Vec::new();
    for pass in 0..4 {
        triangulate_traces(
            &mut traces,
            &feature_map,
            &cameras,
            &rig_index,
            layout,
            config.force_in_front,
        )
        .unwrap();
        norms = solve_pass(
            &mut cameras,
            &feature_map,
            &mut traces,
            &rig_index,
            layout,
            &config,
            pass,
            &mut rng,
        )
        .unwrap();
    }

    for (recovered, expected) in cameras.iter().zip(&truth) {
        assert_relative_eq!(recovered.position, expected.position, epsilon = 5e-4);
        assert_relative_eq!(
            recovered.scaled_axis(),
            expected.scaled_axis(),
            epsilon = 5e-4
        );
    }
    let median = percentile(&norms, 0.5);
    assert!(median < 1e-4, "median reprojection error {median} too high");
}

#[test]
fn sparse_camera_fails_trace_validation() {
    let truth = ground_truth();
    let (feature_map, mut traces) = observe(&truth);

    // strip almost every observation of cam2
    for trace in traces.iter_mut().skip(3) {
        trace
            .references
            .retain(|(image, _)| !image.as_str().starts_with("cam2"));
    }

    let mut cameras = truth.clone();
    let rig_index = RigIndex::new(&cameras);
    let config = SolveConfig {
        min_traces: 10,
        ..SolveConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let err = solve_pass(
        &mut cameras,
        &feature_map,
        &mut traces,
        &rig_index,
        RigLayout::DirPerCamera,
        &config,
        0,
        &mut rng,
    )
    .unwrap_err();
    assert!(err.to_string().contains("cam2"));
}
