//! Mathematical type aliases and small numeric helpers shared by all crates.

use nalgebra::{Matrix3, RealField, Vector2, Vector3};

/// Scalar type used throughout the library (currently `f64`).
pub type Real = f64;

/// 2D vector with [`Real`] components.
pub type Vec2 = Vector2<Real>;
/// 3D vector with [`Real`] components.
pub type Vec3 = Vector3<Real>;
/// 3×3 matrix with [`Real`] entries.
pub type Mat3 = Matrix3<Real>;

/// Depth treated as "infinitely far" by projection helpers and triangulation.
pub const NEAR_INFINITY: Real = 1.0e4;

/// Percentile of a sample by selection, `p` in `[0, 1)`.
///
/// Returns NaN for an empty sample. The index is `floor(p * n)`, so `p = 0.5`
/// is the lower median.
pub fn percentile(values: &[Real], p: Real) -> Real {
    if values.is_empty() {
        return Real::NAN;
    }
    let mut sorted = values.to_vec();
    let idx = ((p * sorted.len() as Real) as usize).min(sorted.len() - 1);
    let (_, nth, _) = sorted.select_nth_unstable_by(idx, Real::total_cmp);
    *nth
}

/// `(radius, theta, phi)` of a cartesian vector, with `theta` the polar angle
/// from +z and `phi = atan2(y, x)`.
pub fn spherical_from_cartesian(v: &Vec3) -> Vec3 {
    let radius = v.norm();
    let theta = (v.z / radius).acos();
    let phi = v.y.atan2(v.x);
    Vec3::new(radius, theta, phi)
}

/// Inverse of [`spherical_from_cartesian`]; generic so it can run under the
/// solver's dual numbers.
pub fn cartesian_from_spherical<S: RealField>(radius: S, theta: S, phi: S) -> Vector3<S> {
    Vector3::new(
        radius.clone() * theta.clone().sin() * phi.clone().cos(),
        radius.clone() * theta.clone().sin() * phi.sin(),
        radius * theta.cos(),
    )
}

/// Rotate `v` by the rotation whose scaled axis (angle times unit axis) is
/// `aa`, using the Rodrigues formula. Generic for autodiff.
pub fn rotate_scaled_axis<S: RealField>(aa: &Vector3<S>, v: &Vector3<S>) -> Vector3<S> {
    let theta2 = aa.dot(aa);
    // series expansion near zero keeps derivatives finite
    if theta2 < S::from_f64(1e-16).unwrap() {
        return v + aa.cross(v);
    }
    let theta = theta2.sqrt();
    let axis = aa / theta.clone();
    let (sin, cos) = (theta.clone().sin(), theta.cos());
    v * cos.clone() + axis.cross(v) * sin + &axis * (axis.dot(v) * (S::one() - cos))
}
