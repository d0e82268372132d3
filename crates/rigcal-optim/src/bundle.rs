//! One bundle adjustment pass.
//!
//! Camera parameters are split into named blocks (`pos/i`, `rot/i`,
//! `principal/k`, `focal/k`, `dist/k`, one `pt/t` per trace) so locking and
//! sharing reduce to block bookkeeping. When positions are free, the rig
//! gauge is pinned by fixing the reference camera's pose and putting the
//! next camera on a fixed-radius sphere around it.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};
use nalgebra::{dvector, DVector};
use rand::Rng;
use tiny_solver::loss_functions::{HuberLoss, Loss};
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;
use tiny_solver::LevenbergMarquardtOptimizer;

use rigcal_core::{
    cartesian_from_spherical, spherical_from_cartesian, CalibrationError, Camera, ImageId, Real,
    Result, RigIndex, RigLayout, SolveConfig, Vec2, Vec3,
};

use crate::factors::{ReprojectionFactor, SphericalReprojectionFactor};
use crate::traces::{FeatureMap, Trace};

/// Per-camera residual weights; all ones unless weighting by trace count.
pub fn camera_weights(
    cameras: &[Camera],
    traces: &[Trace],
    rig_index: &RigIndex,
    layout: RigLayout,
    weight_by_trace_count: bool,
) -> Result<Vec<Real>> {
    let mut weights = vec![1.0; cameras.len()];
    if !weight_by_trace_count {
        return Ok(weights);
    }
    let mut counts = vec![0usize; cameras.len()];
    for trace in traces {
        for (image, _) in &trace.references {
            counts[rig_index.camera_index_for_image(image, layout)?] += 1;
        }
    }
    for (weight, count) in weights.iter_mut().zip(&counts) {
        *weight = *count as Real;
    }
    Ok(weights)
}

/// Fail when a camera contributes suspiciously few observations: below the
/// hard minimum, or a strong negative z-score against the other cameras. The
/// error message lists every offending camera.
pub fn validate_trace_counts(
    cameras: &[Camera],
    counts: &[usize],
    config: &SolveConfig,
) -> Result<()> {
    let n = counts.len() as Real;
    let mean = counts.iter().sum::<usize>() as Real / n;
    let sq_sum = counts.iter().map(|&c| (c * c) as Real).sum::<Real>();
    let stdev = (sq_sum / n - mean * mean).sqrt();

    let mut offenders = Vec::new();
    for (camera, &count) in cameras.iter().zip(counts) {
        debug!("camera {} observes {count} traces", camera.id);
        let z = (count as Real - mean) / stdev;
        if -z > config.outlier_z_threshold || count < config.min_traces {
            offenders.push(format!(
                "too few matches in camera {}: {count}",
                camera.id
            ));
        }
    }
    if offenders.is_empty() {
        Ok(())
    } else {
        Err(CalibrationError::InsufficientTraces(offenders.join("\n")))
    }
}

/// Unweighted reprojection error norms of every observation of every
/// nonempty trace.
pub fn reprojection_norms(
    cameras: &[Camera],
    feature_map: &FeatureMap,
    traces: &[Trace],
    rig_index: &RigIndex,
    layout: RigLayout,
) -> Result<Vec<Real>> {
    let mut norms = Vec::new();
    for trace in traces.iter().filter(|t| !t.references.is_empty()) {
        for (image, index) in &trace.references {
            let i = rig_index.camera_index_for_image(image, layout)?;
            let feature = lookup_feature(feature_map, image, *index)?;
            norms.push((cameras[i].pixel(&trace.position) - feature).norm());
        }
    }
    Ok(norms)
}

fn lookup_feature(feature_map: &FeatureMap, image: &ImageId, index: usize) -> Result<Vec2> {
    feature_map
        .get(image)
        .and_then(|features| features.get(index))
        .map(|feature| feature.position)
        .ok_or_else(|| {
            CalibrationError::InvariantViolation(format!(
                "trace references missing feature {image}:{index}"
            ))
        })
}

fn positions_unlocked(config: &SolveConfig, pass: usize) -> bool {
    !config.lock_positions && pass != 0
}

/// True with probability `numerator / denominator`.
fn random_sample(numerator: usize, denominator: usize, rng: &mut impl Rng) -> bool {
    numerator > rng.random_range(0..denominator)
}

struct SphericalSetup {
    reference: usize,
    relative: usize,
    radius: Real,
    theta: Real,
    phi: Real,
}

fn vec3_of(block: &DVector<Real>) -> Vec3 {
    Vec3::new(block[0], block[1], block[2])
}

/// Build and solve the reprojection problem for one pass, writing optimized
/// parameters back into `cameras` and optimized positions back into
/// `traces`. Returns the post-solve reprojection error norms of the
/// observations that entered the problem.
#[allow(clippy::too_many_arguments)]
pub fn solve_pass(
    cameras: &mut [Camera],
    feature_map: &FeatureMap,
    traces: &mut [Trace],
    rig_index: &RigIndex,
    layout: RigLayout,
    config: &SolveConfig,
    pass: usize,
    rng: &mut impl Rng,
) -> Result<Vec<Real>> {
    let weights = camera_weights(
        cameras,
        traces,
        rig_index,
        layout,
        config.weight_by_trace_count,
    )?;

    let positions: Vec<Vec3> = cameras.iter().map(|c| c.position).collect();
    let rotations: Vec<Vec3> = cameras.iter().map(|c| c.scaled_axis()).collect();
    let principals: Vec<Vec2> = cameras.iter().map(|c| c.principal).collect();
    let focals: Vec<Real> = cameras
        .iter()
        .map(|c| c.scalar_focal())
        .collect::<Result<_>>()?;
    let distortions: Vec<Vec3> = cameras.iter().map(|c| *c.distortion()).collect();

    // a locked reference camera and a fixed baseline to the next camera pin
    // the rig's pose and scale while positions are free
    let spherical = if positions_unlocked(config, pass) {
        let reference = match &config.reference_camera {
            Some(id) => rig_index.camera_index(id)?,
            None => 0,
        };
        let relative = (reference + 1) % cameras.len();
        let sph = spherical_from_cartesian(&(positions[relative] - positions[reference]));
        Some(SphericalSetup {
            reference,
            relative,
            radius: sph.x,
            theta: sph.y,
            phi: sph.z,
        })
    } else {
        None
    };

    let mut problem = Problem::new();
    let mut values: HashMap<String, DVector<Real>> = HashMap::new();
    let mut counts = vec![0usize; cameras.len()];
    let mut pos_blocks = BTreeSet::new();
    let mut rot_blocks = BTreeSet::new();
    let mut principal_blocks = BTreeSet::new();
    let mut focal_blocks = BTreeSet::new();
    let mut dist_blocks = BTreeSet::new();
    let mut included = Vec::new();

    for (t, trace) in traces.iter().enumerate() {
        if trace.references.is_empty() {
            continue;
        }
        if config.cap_traces > 0 && !random_sample(config.cap_traces, traces.len(), rng) {
            continue;
        }
        included.push(t);
        let point = format!("pt/{t}");
        values
            .entry(point.clone())
            .or_insert_with(|| dvector![trace.position.x, trace.position.y, trace.position.z]);

        for (image, index) in &trace.references {
            let i = rig_index.camera_index_for_image(image, layout)?;
            counts[i] += 1;
            let pixel = lookup_feature(feature_map, image, *index)?;
            let camera = &cameras[i];
            let group = rig_index.by_group.get(&camera.group).copied().unwrap_or(i);
            let kp = if config.shared_principal_and_focal { group } else { i };
            let kd = if config.shared_distortion { group } else { i };

            let rot = format!("rot/{i}");
            let principal = format!("principal/{kp}");
            let focal = format!("focal/{kp}");
            let dist = format!("dist/{kd}");
            rot_blocks.insert(i);
            principal_blocks.insert(kp);
            focal_blocks.insert(kp);
            dist_blocks.insert(kd);
            values
                .entry(rot.clone())
                .or_insert_with(|| dvector![rotations[i].x, rotations[i].y, rotations[i].z]);
            values
                .entry(principal.clone())
                .or_insert_with(|| dvector![principals[kp].x, principals[kp].y]);
            values
                .entry(focal.clone())
                .or_insert_with(|| dvector![focals[kp]]);
            values.entry(dist.clone()).or_insert_with(|| {
                dvector![distortions[kd].x, distortions[kd].y, distortions[kd].z]
            });

            let loss: Option<Box<dyn Loss + Send>> = if config.robust {
                Some(Box::new(HuberLoss::new(config.robust_scale)))
            } else {
                None
            };

            match &spherical {
                Some(setup) if setup.relative == i => {
                    values
                        .entry("sph".to_string())
                        .or_insert_with(|| dvector![setup.theta, setup.phi]);
                    let names = [
                        "sph".to_string(),
                        rot,
                        principal,
                        focal,
                        dist,
                        point.clone(),
                    ];
                    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                    problem.add_residual_block(
                        2,
                        &refs,
                        Box::new(SphericalReprojectionFactor {
                            projection: camera.projection,
                            pixel,
                            distortion_max: cameras[kd].distortion_max(),
                            weight: weights[i],
                            radius: setup.radius,
                            reference_position: positions[setup.reference],
                        }),
                        loss,
                    );
                }
                _ => {
                    let pos = format!("pos/{i}");
                    pos_blocks.insert(i);
                    values
                        .entry(pos.clone())
                        .or_insert_with(|| dvector![positions[i].x, positions[i].y, positions[i].z]);
                    let names = [pos, rot, principal, focal, dist, point.clone()];
                    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                    problem.add_residual_block(
                        2,
                        &refs,
                        Box::new(ReprojectionFactor {
                            projection: camera.projection,
                            pixel,
                            distortion_max: cameras[kd].distortion_max(),
                            weight: weights[i],
                        }),
                        loss,
                    );
                }
            }
        }
    }

    validate_trace_counts(cameras, &counts, config)?;

    info!("pass {pass}");

    // focal and distortion always stay locked on the first pass
    if pass == 0 || config.lock_focals {
        for k in &focal_blocks {
            problem.fix_variable(&format!("focal/{k}"), 0);
        }
    }
    if pass == 0 || config.lock_distortions {
        for k in &dist_blocks {
            for idx in 0..3 {
                problem.fix_variable(&format!("dist/{k}"), idx);
            }
        }
    }
    if config.lock_principals {
        for k in &principal_blocks {
            for idx in 0..2 {
                problem.fix_variable(&format!("principal/{k}"), idx);
            }
        }
    }
    match &spherical {
        Some(setup) => {
            if pos_blocks.contains(&setup.reference) {
                for idx in 0..3 {
                    problem.fix_variable(&format!("pos/{}", setup.reference), idx);
                }
            }
            if rot_blocks.contains(&setup.reference) {
                for idx in 0..3 {
                    problem.fix_variable(&format!("rot/{}", setup.reference), idx);
                }
            }
        }
        None => {
            for i in &pos_blocks {
                for idx in 0..3 {
                    problem.fix_variable(&format!("pos/{i}"), idx);
                }
            }
        }
    }
    if config.lock_rotations {
        for i in &rot_blocks {
            for idx in 0..3 {
                problem.fix_variable(&format!("rot/{i}"), idx);
            }
        }
    }

    let options = OptimizerOptions {
        max_iteration: config.max_iterations,
        min_rel_error_decrease_threshold: config.function_tolerance,
        verbosity_level: 0,
        ..OptimizerOptions::default()
    };
    let optimizer = LevenbergMarquardtOptimizer::default();
    let solution = optimizer
        .optimize(&problem, &values, Some(options))
        .ok_or_else(|| {
            CalibrationError::NonConvergence(format!(
                "bundle adjustment failed to converge on pass {pass}"
            ))
        })?;

    // write the optimized parameters back
    for (i, camera) in cameras.iter_mut().enumerate() {
        let group = rig_index.by_group.get(&camera.group).copied().unwrap_or(i);
        let kp = if config.shared_principal_and_focal { group } else { i };
        let kd = if config.shared_distortion { group } else { i };

        let relative = spherical.as_ref().filter(|s| s.relative == i);
        camera.position = match (relative, solution.get("sph")) {
            (Some(setup), Some(sph)) => {
                positions[setup.reference]
                    + cartesian_from_spherical(setup.radius, sph[0], sph[1])
            }
            _ => solution
                .get(&format!("pos/{i}"))
                .map(vec3_of)
                .unwrap_or(positions[i]),
        };
        let rotation = solution
            .get(&format!("rot/{i}"))
            .map(vec3_of)
            .unwrap_or(rotations[i]);
        camera.set_scaled_axis(&rotation);
        camera.principal = solution
            .get(&format!("principal/{kp}"))
            .map(|b| Vec2::new(b[0], b[1]))
            .unwrap_or(principals[kp]);
        let focal = solution
            .get(&format!("focal/{kp}"))
            .map(|b| b[0])
            .unwrap_or(focals[kp]);
        camera.set_scalar_focal(focal);
        let distortion = solution
            .get(&format!("dist/{kd}"))
            .map(vec3_of)
            .unwrap_or(distortions[kd]);
        camera.set_distortion(&distortion);
    }
    for &t in &included {
        if let Some(point) = solution.get(&format!("pt/{t}")) {
            traces[t].position = vec3_of(point);
        }
    }

    // post-solve errors over the observations that entered the problem
    let mut norms = Vec::new();
    for &t in &included {
        let trace = &traces[t];
        for (image, index) in &trace.references {
            let i = rig_index.camera_index_for_image(image, layout)?;
            let pixel = lookup_feature(feature_map, image, *index)?;
            norms.push((cameras[i].pixel(&trace.position) - pixel).norm());
        }
    }
    Ok(norms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigcal_core::Projection;

    fn named_camera(id: &str) -> Camera {
        let mut camera = Camera::new(
            Projection::Rectilinear,
            Vec2::new(640.0, 480.0),
            Vec2::new(500.0, -500.0),
        );
        camera.id = id.to_string();
        camera
    }

    #[test]
    fn trace_count_validation_names_every_offender() {
        let cameras: Vec<Camera> = ["cam0", "cam1", "cam2", "cam3"]
            .into_iter()
            .map(named_camera)
            .collect();
        let config = SolveConfig {
            min_traces: 10,
            ..SolveConfig::default()
        };
        let err = validate_trace_counts(&cameras, &[100, 3, 100, 7], &config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cam1"));
        assert!(message.contains("cam3"));
        assert!(!message.contains("cam0"));

        validate_trace_counts(&cameras, &[100, 90, 100, 95], &config).unwrap();
    }

    #[test]
    fn weights_default_to_one() {
        let cameras = vec![named_camera("cam0"), named_camera("cam1")];
        let index = RigIndex::new(&cameras);
        let weights =
            camera_weights(&cameras, &[], &index, RigLayout::DirPerCamera, false).unwrap();
        assert_eq!(weights, vec![1.0, 1.0]);
    }

    #[test]
    fn weights_count_trace_references() {
        let cameras = vec![named_camera("cam0"), named_camera("cam1")];
        let index = RigIndex::new(&cameras);
        let mut trace = Trace::new();
        trace.add(ImageId::from("cam0/0"), 0);
        trace.add(ImageId::from("cam1/0"), 0);
        let mut other = Trace::new();
        other.add(ImageId::from("cam0/0"), 1);
        let weights = camera_weights(
            &cameras,
            &[trace, other],
            &index,
            RigLayout::DirPerCamera,
            true,
        )
        .unwrap();
        assert_eq!(weights, vec![2.0, 1.0]);
    }
}
