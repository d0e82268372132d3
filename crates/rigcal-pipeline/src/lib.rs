//! The calibration driver.
//!
//! [`driver`] runs the refinement passes of [`geometric_calibration`]:
//! outlier rejection, trace assembly, triangulation and bundle adjustment,
//! repeated until the camera parameters settle. [`synthetic`] fabricates
//! noisy artificial observations of a known rig for accuracy experiments,
//! and [`report`] renders the error statistics logged between passes.

/// Refinement passes and the experiment loop.
pub mod driver;
/// Match outlier rejection.
pub mod outliers;
/// Error statistics, RMSE reports and point cloud export.
pub mod report;
/// Per-camera reprojection errors.
pub mod reproj;
/// Artificial observations of a known rig.
pub mod synthetic;

pub use driver::*;
pub use outliers::*;
pub use report::*;
pub use reproj::*;
pub use synthetic::*;
