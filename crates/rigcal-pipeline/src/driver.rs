//! Refinement passes and the experiment loop.

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rigcal_core::{
    percentile, perturb_cameras, CalibrationConfig, CalibrationError, Camera, MatcherConfig, Real,
    Result, Rig, RigIndex, RigLayout,
};
use rigcal_match::{load_matches, remove_sparse_overlaps, Overlap};
use rigcal_optim::{
    assemble_traces, feature_map_from_positions, remove_invalid_traces, reprojection_norms,
    solve_pass, triangulate_traces, FeatureMap,
};

use crate::outliers::remove_outliers;
use crate::report::{
    camera_rmse_report, log_per_camera_errors, reprojection_report, save_points_file,
    save_points_file_json, weighted_norms,
};
use crate::reproj::reprojection_errors;
use crate::synthetic::generate_artificial_points;

/// Optional point cloud outputs, written after the final pass.
#[derive(Clone, Debug, Default)]
pub struct PointsFiles {
    pub text: Option<PathBuf>,
    pub json: Option<PathBuf>,
}

/// The feature map and pairwise matches calibration starts from. Each pass
/// begins from a fresh copy; outlier removal is always relative to the full
/// input, not to what the previous pass left over.
#[derive(Clone, Debug, Default)]
pub struct CalibrationData {
    pub feature_map: FeatureMap,
    pub overlaps: Vec<Overlap>,
}

impl CalibrationData {
    /// Load a matches document, filtered by score and by overlap sparsity.
    pub fn load(
        path: impl AsRef<Path>,
        rig_index: &RigIndex,
        layout: RigLayout,
        matcher: &MatcherConfig,
    ) -> Result<Self> {
        let (positions, mut overlaps) =
            load_matches(path, rig_index, layout, matcher.match_score_threshold)?;
        remove_sparse_overlaps(&mut overlaps, matcher.remove_sparse_overlaps);
        Ok(CalibrationData {
            feature_map: feature_map_from_positions(&positions),
            overlaps,
        })
    }

    /// Fabricate observations of the ground-truth rig for an experiment.
    pub fn synthetic(
        ground_truth: &[Camera],
        config: &CalibrationConfig,
        rng: &mut impl Rng,
    ) -> Self {
        let mut data = CalibrationData::default();
        generate_artificial_points(
            &mut data.feature_map,
            &mut data.overlaps,
            ground_truth,
            config.layout,
            &config.experiment,
            rng,
        );
        data
    }
}

/// One refinement pass: reject outlier matches, assemble and triangulate
/// traces, then bundle-adjust the cameras. Returns the median post-solve
/// reprojection error in pixels. The last pass warns when that median stays
/// above `max_error` and writes the requested point cloud files.
pub fn refine(
    cameras: &mut [Camera],
    data: &CalibrationData,
    rig_index: &RigIndex,
    config: &CalibrationConfig,
    pass: usize,
    rng: &mut impl Rng,
    points_files: &PointsFiles,
) -> Result<Real> {
    let timer = Instant::now();
    let solve = &config.solve;
    let layout = config.layout;
    let mut feature_map = data.feature_map.clone();
    let mut overlaps = data.overlaps.clone();

    info!("removing outlier matches");
    remove_outliers(
        &mut overlaps,
        &feature_map,
        &[],
        cameras,
        rig_index,
        layout,
        solve.outlier_factor,
        solve.force_in_front,
    )?;

    info!("assembling traces and removing outlier traces");
    let mut traces = assemble_traces(&mut feature_map, &overlaps)?;
    triangulate_traces(
        &mut traces,
        &feature_map,
        cameras,
        rig_index,
        layout,
        solve.force_in_front,
    )?;
    remove_outliers(
        &mut overlaps,
        &feature_map,
        &traces,
        cameras,
        rig_index,
        layout,
        solve.outlier_factor,
        solve.force_in_front,
    )?;

    info!("reassembling traces with outliers removed");
    let mut traces = assemble_traces(&mut feature_map, &overlaps)?;
    if !solve.keep_invalid_traces {
        remove_invalid_traces(&mut traces, &mut feature_map);
    }
    triangulate_traces(
        &mut traces,
        &feature_map,
        cameras,
        rig_index,
        layout,
        solve.force_in_front,
    )?;

    let before = reprojection_norms(cameras, &feature_map, &traces, rig_index, layout)?;
    info!("{}", reprojection_report(&before, solve));
    log_per_camera_errors(
        cameras,
        &reprojection_errors(
            &overlaps,
            &feature_map,
            &traces,
            cameras,
            rig_index,
            layout,
            solve.force_in_front,
        )?,
    );

    let norms = solve_pass(
        cameras,
        &feature_map,
        &mut traces,
        rig_index,
        layout,
        solve,
        pass,
        rng,
    )?;
    info!("{}", reprojection_report(&norms, solve));
    log_per_camera_errors(
        cameras,
        &reprojection_errors(
            &overlaps,
            &feature_map,
            &traces,
            cameras,
            rig_index,
            layout,
            solve.force_in_front,
        )?,
    );

    let median = percentile(&weighted_norms(&norms, solve), 0.5);
    let last_pass = pass + 1 == solve.pass_count;
    if last_pass && median > solve.max_error {
        warn!("final pass median error too high: {median}");
    }

    if last_pass {
        if let Some(path) = &points_files.text {
            save_points_file(path, &traces)?;
        }
        if let Some(path) = &points_files.json {
            save_points_file_json(path, &feature_map, &traces)?;
        }
    }
    if config.enable_timing {
        info!("pass {pass} timing: {:.3?}", timer.elapsed());
    }
    Ok(median)
}

/// Run `f` inside a dedicated rayon pool of `threads` workers, or on the
/// global pool when `threads` is 0.
fn with_solver_pool<T: Send>(
    threads: usize,
    f: impl FnOnce() -> Result<T> + Send,
) -> Result<T> {
    if threads == 0 {
        return f();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| CalibrationError::Config(format!("solver thread pool: {e}")))?;
    pool.install(f)
}

/// Calibrate the rig from the given matches, running the configured number
/// of perturb-and-recalibrate experiments. Returns the cameras of the last
/// experiment and its final median reprojection error.
pub fn geometric_calibration(
    ground_truth: &Rig,
    data: &CalibrationData,
    config: &CalibrationConfig,
    points_files: &PointsFiles,
) -> Result<(Rig, Real)> {
    let rig_index = RigIndex::new(ground_truth);
    let mut rng = match config.experiment.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut result = ground_truth.clone();
    let mut median = 0.0;
    for experiment in 0..config.experiment.experiments {
        info!("experiment {experiment}");
        let mut cameras = ground_truth.clone();
        let e = &config.experiment;
        perturb_cameras(
            &mut cameras,
            &mut rng,
            e.perturb_positions,
            e.perturb_rotations,
            e.perturb_principals,
            e.perturb_focals,
        )?;
        info!("{}", camera_rmse_report(&cameras, ground_truth));

        let timer = Instant::now();
        for pass in 0..config.solve.pass_count {
            median = with_solver_pool(config.threads.solve, || {
                refine(
                    &mut cameras,
                    data,
                    &rig_index,
                    config,
                    pass,
                    &mut rng,
                    points_files,
                )
            })?;
            info!("pass {pass}: {}", camera_rmse_report(&cameras, ground_truth));
        }
        if config.enable_timing {
            info!("aggregate timing: {:.3?}", timer.elapsed());
        }
        result = cameras;
    }
    Ok((result, median))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigcal_core::{ExperimentConfig, Projection, Vec2};

    #[test]
    fn zero_experiments_returns_the_input_rig() {
        let mut camera = Camera::new(
            Projection::Rectilinear,
            Vec2::new(640.0, 480.0),
            Vec2::new(500.0, -500.0),
        );
        camera.id = "cam0".to_string();
        let rig = vec![camera];
        let config = CalibrationConfig {
            experiment: ExperimentConfig {
                experiments: 0,
                ..ExperimentConfig::default()
            },
            ..CalibrationConfig::default()
        };

        let (result, median) = geometric_calibration(
            &rig,
            &CalibrationData::default(),
            &config,
            &PointsFiles::default(),
        )
        .unwrap();
        assert_eq!(result[0].id, "cam0");
        assert_eq!(median, 0.0);
    }
}
