//! Core primitives for `rigcal`:
//! - linear algebra type aliases (`Real`, `Vec2`, `Vec3`, ...),
//! - the [`Camera`] model (projection variants, radial distortion, FOV),
//! - rig JSON (de)serialization,
//! - image-id layout conventions,
//! - the [`CalibrationConfig`] family,
//! - the [`CalibrationError`] enum.
//!
//! Camera pipeline:
//! `pixel = focal ∘ distortion ∘ projection(rotation * (world - position)) + principal`

/// Camera model and projection math.
pub mod camera;
/// Configuration structures with the stock defaults.
pub mod config;
/// Error type shared by the whole workspace.
pub mod error;
/// Image identifiers and on-disk layout conventions.
pub mod image_id;
/// Linear algebra type aliases and small numeric helpers.
pub mod math;
/// Rig document I/O.
pub mod rig;

pub use camera::*;
pub use config::*;
pub use error::*;
pub use image_id::*;
pub use math::*;
pub use rig::*;
