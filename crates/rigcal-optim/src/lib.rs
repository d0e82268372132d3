//! Geometric refinement: trace assembly, nonlinear triangulation and the
//! multi-parameter-block bundle adjuster.
//!
//! A [`Trace`] is a world point observed by several images; traces are
//! assembled by flood-filling trace membership across pairwise matches. Each
//! refinement pass triangulates the traces against the current cameras and
//! then jointly optimizes camera parameters and trace positions with
//! `tiny-solver`, using residual factors generic over `nalgebra::RealField`
//! so the solver can differentiate them with dual numbers.

pub mod bundle;
pub mod factors;
pub mod traces;
pub mod triangulate;

pub use bundle::{camera_weights, reprojection_norms, solve_pass, validate_trace_counts};
pub use factors::{ReprojectionFactor, SphericalReprojectionFactor, TriangulationFactor};
pub use traces::{
    assemble_traces, feature_map_from_positions, find_or_add_overlap, remove_invalid_traces,
    Feature, FeatureMap, Trace,
};
pub use triangulate::{average_at_distance, triangulate, triangulate_traces, Observation};
