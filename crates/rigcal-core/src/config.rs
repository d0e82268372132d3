//! Configuration for the whole pipeline.
//!
//! One immutable [`CalibrationConfig`] is built up front (from a JSON file,
//! CLI overrides, or the defaults below) and passed by reference; nothing
//! reads process-wide state. Defaults are the stock values tuned for
//! multi-camera video rigs.

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::image_id::RigLayout;
use crate::math::Real;

/// Corner detection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of halved resolutions to search for features.
    pub octave_count: usize,
    /// Maximum corners to detect per octave.
    pub max_corners: usize,
    /// Accept corners scoring at least this fraction of the best response.
    pub min_feature_quality: Real,
    /// Minimum distance between corners within an octave, in pixels.
    pub min_feature_distance: Real,
    /// Harris detector free parameter.
    pub harris_k: Real,
    /// Harris response window radius in pixels.
    pub harris_window_radius: usize,
    /// Window radius for sub-pixel corner refinement.
    pub refine_radius: usize,
    /// Termination epsilon for sub-pixel refinement.
    pub refine_epsilon: Real,
    /// Patch half-width for ZNCC matching; also the border margin inside
    /// which corners are rejected.
    pub zncc_window_radius: usize,
    /// Drop corners closer than this to a corner from a coarser octave;
    /// non-positive disables deduplication.
    pub deduplicate_radius: Real,
    /// Hard minimum of corners per camera.
    pub min_features: usize,
    /// Sample patches with nearest neighbor instead of bilinear.
    pub use_nearest: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            octave_count: 4,
            max_corners: 10_000,
            min_feature_quality: 1e-5,
            min_feature_distance: 10.0,
            harris_k: 0.04,
            harris_window_radius: 5,
            refine_radius: 5,
            refine_epsilon: 1e-6,
            zncc_window_radius: 16,
            deduplicate_radius: 3.0,
            min_features: 1500,
            use_nearest: false,
        }
    }
}

/// Patch matching settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum scene depth in meters.
    pub depth_min: Real,
    /// Maximum scene depth in meters.
    pub depth_max: Real,
    /// Number of disparity samples between the depth bounds.
    pub depth_samples: usize,
    /// Beyond this depth the reprojected patch is reused between samples.
    pub max_depth_for_remap: Real,
    /// Skip camera pairs whose geometric overlap fraction is below this.
    pub overlap_threshold: Real,
    /// Maximum drift of the re-detected corner in a reprojected patch.
    pub drift_tolerance: Real,
    /// Skip a disparity sample when its search box overlaps the previous one
    /// by more than this fraction.
    pub search_overlap: Real,
    /// Search box half-width in pixels.
    pub search_radius: Real,
    /// Minimum ZNCC score for a match; 0 also means "ignore scores" when
    /// loading a matches file.
    pub match_score_threshold: Real,
    /// Minimum score gap between a corner's best and second-best candidate.
    pub zncc_delta_threshold: Real,
    /// Use the alternate mean-normalized ZNCC formula.
    pub custom_zncc: bool,
    /// Drop overlaps with fewer matches than this fraction of the mean;
    /// 0 disables.
    pub remove_sparse_overlaps: Real,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            depth_min: 1.0,
            depth_max: 100.0,
            depth_samples: 1000,
            max_depth_for_remap: 50.0,
            overlap_threshold: 0.0,
            drift_tolerance: 0.5,
            search_overlap: 0.25,
            search_radius: 100.0,
            match_score_threshold: 0.75,
            zncc_delta_threshold: 0.05,
            custom_zncc: false,
            remove_sparse_overlaps: 0.0,
        }
    }
}

/// Bundle adjustment settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveConfig {
    /// Number of outlier-removal/solve passes.
    pub pass_count: usize,
    /// Keep camera positions fixed in every pass.
    pub lock_positions: bool,
    /// Keep camera rotations fixed.
    pub lock_rotations: bool,
    /// Keep focal lengths fixed. Pass 0 locks them regardless.
    pub lock_focals: bool,
    /// Keep distortion coefficients fixed. Pass 0 locks them regardless.
    pub lock_distortions: bool,
    /// Keep principal points fixed.
    pub lock_principals: bool,
    /// One distortion block shared by each camera group.
    pub shared_distortion: bool,
    /// One principal/focal block shared by each camera group.
    pub shared_principal_and_focal: bool,
    /// Apply a Huber loss to residuals.
    pub robust: bool,
    /// Scale of the Huber loss.
    pub robust_scale: Real,
    /// Remove matches whose squared error exceeds the camera median times
    /// this factor.
    pub outlier_factor: Real,
    /// Hard minimum of traces per camera.
    pub min_traces: usize,
    /// Cameras whose trace count z-score is below minus this are offenders.
    pub outlier_z_threshold: Real,
    /// Id of the camera whose pose anchors the rig; defaults to the first.
    pub reference_camera: Option<String>,
    /// Warn when the final pass median error exceeds this, in pixels.
    pub max_error: Real,
    /// Flip triangulated points that land behind their cameras.
    pub force_in_front: bool,
    /// Keep traces that observe the same camera twice.
    pub keep_invalid_traces: bool,
    /// Randomly subsample traces down to roughly this count; 0 disables.
    pub cap_traces: usize,
    /// Weight residuals by the inverse of the camera's trace count.
    pub weight_by_trace_count: bool,
    /// Report statistics of weighted rather than raw residuals.
    pub weighted_statistics: bool,
    /// Iteration cap for the bundle solver.
    pub max_iterations: usize,
    /// Relative cost decrease below which the solver stops.
    pub function_tolerance: Real,
}

impl Default for SolveConfig {
    fn default() -> Self {
        SolveConfig {
            pass_count: 10,
            lock_positions: true,
            lock_rotations: false,
            lock_focals: false,
            lock_distortions: true,
            lock_principals: false,
            shared_distortion: true,
            shared_principal_and_focal: false,
            robust: true,
            robust_scale: 1.0,
            outlier_factor: 5.0,
            min_traces: 10,
            outlier_z_threshold: 3.0,
            reference_camera: None,
            max_error: 0.5,
            force_in_front: true,
            keep_invalid_traces: false,
            cap_traces: 0,
            weight_by_trace_count: false,
            weighted_statistics: false,
            max_iterations: 100,
            function_tolerance: 1e-6,
        }
    }
}

/// Synthetic-data experiment settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Number of perturb-and-recalibrate experiments to run.
    pub experiments: usize,
    /// RNG seed; random when unset.
    pub seed: Option<u64>,
    /// Uniform perturbation of camera positions, in meters.
    pub perturb_positions: Real,
    /// Uniform perturbation of camera rotations, in radians.
    pub perturb_rotations: Real,
    /// Uniform perturbation of principal points, in pixels.
    pub perturb_principals: Real,
    /// Uniform perturbation of scalar focals, in pixels per radian.
    pub perturb_focals: Real,
    /// Artificial points to generate.
    pub point_count: usize,
    /// Gaussian pixel noise added to artificial observations.
    pub point_error_stddev: Real,
    /// Minimum distance of artificial points, in meters.
    pub point_min_dist: Real,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            experiments: 1,
            seed: None,
            perturb_positions: 0.0,
            perturb_rotations: 0.0,
            perturb_principals: 0.0,
            perturb_focals: 0.0,
            point_count: 10_000,
            point_error_stddev: 0.5,
            point_min_dist: 1.0,
        }
    }
}

/// Worker counts per stage. 0 uses all cores; 1 runs serially (and keeps
/// per-stage timers trustworthy).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    pub detect: usize,
    pub matching: usize,
    pub solve: usize,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        ThreadsConfig {
            detect: 0,
            matching: 0,
            solve: 0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub layout: RigLayout,
    /// Log per-stage wall-clock timing.
    pub enable_timing: bool,
    pub detector: DetectorConfig,
    pub matcher: MatcherConfig,
    pub solve: SolveConfig,
    pub experiment: ExperimentConfig,
    pub threads: ThreadsConfig,
}

impl CalibrationConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: CalibrationConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.matcher.depth_min <= 0.0 || self.matcher.depth_max <= self.matcher.depth_min {
            return Err(CalibrationError::Config(format!(
                "depth range [{}, {}] is not a positive interval",
                self.matcher.depth_min, self.matcher.depth_max
            )));
        }
        if self.matcher.depth_samples < 2 {
            return Err(CalibrationError::Config(
                "depth_samples must be at least 2".to_string(),
            ));
        }
        if self.detector.zncc_window_radius == 0 {
            return Err(CalibrationError::Config(
                "zncc_window_radius must be positive".to_string(),
            ));
        }
        if self.solve.pass_count == 0 {
            return Err(CalibrationError::Config(
                "pass_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
