//! Nonlinear triangulation of traces.

use std::collections::HashMap;

use nalgebra::dvector;
use rayon::prelude::*;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;
use tiny_solver::LevenbergMarquardtOptimizer;

use rigcal_core::{
    Camera, CalibrationError, Real, Result, RigIndex, RigLayout, Vec2, Vec3, NEAR_INFINITY,
};

use crate::factors::TriangulationFactor;
use crate::traces::{FeatureMap, Trace};

/// One camera's view of a world point.
pub struct Observation<'a> {
    pub camera: &'a Camera,
    pub pixel: Vec2,
}

/// Mean of the observation rays' points at the given depth.
pub fn average_at_distance(observations: &[Observation], distance: Real) -> Vec3 {
    let mut sum = Vec3::zeros();
    for obs in observations {
        sum += obs.camera.rig_at_depth(&obs.pixel, distance);
    }
    sum / observations.len() as Real
}

/// Initial triangulation guess; the exact depth is not important, the solver
/// only needs to start in front of the cameras.
const INITIAL_DISTANCE: Real = 10.0;

/// Least-squares world point for a set of observations.
///
/// The optimization variable is the inverse point `world / |world|²`, so it
/// scales with disparity and cannot cheaply overshoot behind the cameras.
/// If the solver fails to converge within its few iterations the initial
/// average is kept. With `force_in_front`, a solution behind any observing
/// camera is replaced by the near-infinity ray average.
pub fn triangulate(observations: &[Observation], force_in_front: bool) -> Vec3 {
    debug_assert!(observations.len() >= 2, "triangulation needs two views");

    let initial = average_at_distance(observations, INITIAL_DISTANCE);
    let inv = initial / initial.norm_squared();

    let mut problem = Problem::new();
    for obs in observations {
        problem.add_residual_block(
            2,
            &["inv"],
            Box::new(TriangulationFactor::new(obs.camera, obs.pixel)),
            None,
        );
    }
    let mut values = HashMap::new();
    values.insert("inv".to_string(), dvector![inv.x, inv.y, inv.z]);

    let options = OptimizerOptions {
        max_iteration: 10,
        verbosity_level: 0,
        ..OptimizerOptions::default()
    };
    let optimizer = LevenbergMarquardtOptimizer::default();
    let world = optimizer
        .optimize(&problem, &values, Some(options))
        .and_then(|mut solution| solution.remove("inv"))
        .map(|inv| {
            let inv = Vec3::new(inv[0], inv[1], inv[2]);
            inv / inv.norm_squared()
        })
        .unwrap_or(initial);

    if force_in_front
        && observations
            .iter()
            .any(|obs| obs.camera.is_behind(&world))
    {
        return average_at_distance(observations, NEAR_INFINITY);
    }
    world
}

/// Triangulate every nonempty trace in place, in parallel.
pub fn triangulate_traces(
    traces: &mut [Trace],
    feature_map: &FeatureMap,
    cameras: &[Camera],
    rig_index: &RigIndex,
    layout: RigLayout,
    force_in_front: bool,
) -> Result<()> {
    traces.par_iter_mut().try_for_each(|trace| {
        if trace.references.is_empty() {
            return Ok(());
        }
        let mut observations = Vec::with_capacity(trace.references.len());
        for (image, index) in &trace.references {
            let camera = &cameras[rig_index.camera_index_for_image(image, layout)?];
            let feature = feature_map
                .get(image)
                .and_then(|features| features.get(*index))
                .ok_or_else(|| {
                    CalibrationError::InvariantViolation(format!(
                        "trace references missing feature {image}:{index}"
                    ))
                })?;
            observations.push(Observation {
                camera,
                pixel: feature.position,
            });
        }
        trace.position = triangulate(&observations, force_in_front);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rigcal_core::Projection;

    fn camera_at(position: Vec3) -> Camera {
        let mut camera = Camera::new(
            Projection::Rectilinear,
            Vec2::new(1280.0, 1024.0),
            Vec2::new(1000.0, -1000.0),
        );
        camera.position = position;
        camera
    }

    #[test]
    fn two_views_recover_the_point() {
        let cameras = [
            camera_at(Vec3::new(0.0, 0.0, 0.0)),
            camera_at(Vec3::new(0.5, 0.0, 0.0)),
        ];
        let world = Vec3::new(0.3, -0.2, -5.0);
        let observations: Vec<Observation> = cameras
            .iter()
            .map(|camera| Observation {
                camera,
                pixel: camera.pixel(&world),
            })
            .collect();

        let result = triangulate(&observations, false);
        assert_relative_eq!(result, world, epsilon = 1e-3);
    }

    fn fisheye_at(position: Vec3) -> Camera {
        let mut camera = Camera::new(
            Projection::FTheta,
            Vec2::new(2048.0, 2048.0),
            Vec2::new(600.0, -600.0),
        );
        camera.position = position;
        camera
    }

    #[test]
    fn point_behind_falls_back_to_near_infinity() {
        // full-sphere cameras can observe a point behind their sensor planes
        let cameras = [
            fisheye_at(Vec3::new(0.0, 0.0, 0.0)),
            fisheye_at(Vec3::new(0.5, 0.0, 0.0)),
        ];
        let behind = Vec3::new(0.3, 0.2, 5.0);
        let observations: Vec<Observation> = cameras
            .iter()
            .map(|camera| Observation {
                camera,
                pixel: camera.pixel(&behind),
            })
            .collect();

        let result = triangulate(&observations, true);
        let fallback = average_at_distance(&observations, NEAR_INFINITY);
        assert_relative_eq!(result, fallback, epsilon = 1e-6);
    }
}
