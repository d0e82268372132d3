//! The camera model.
//!
//! A camera maps rig-space points to pixels through four stages:
//! rotate/translate into camera space, project onto the sensor (one of four
//! radial projections), apply polynomial radial distortion, then scale by the
//! focal vector and offset by the principal point.
//!
//! Camera space is right-handed with +x right, +y up and +z backward, so a
//! point in front of the camera has negative z. The rotation matrix stores
//! `right`, `up` and `backward` as its rows.
//!
//! Projection radii as a function of the angle `theta` off the optical axis
//! (see <https://wiki.panotools.org/Fisheye_Projection>):
//! - `FTHETA`: `r = theta`
//! - `RECTILINEAR`: `r = tan(theta)`
//! - `EQUISOLID`: `r = 2 sin(theta / 2)`
//! - `ORTHOGRAPHIC`: `r = sin(theta)`

use nalgebra::{RealField, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::math::{Mat3, Real, Vec2, Vec3, NEAR_INFINITY};

/// Sensor projection variants. The set is closed; projection math matches
/// exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Projection {
    FTheta,
    Rectilinear,
    Equisolid,
    Orthographic,
}

impl Projection {
    /// Cosine of the widest field of view the projection supports:
    /// a hemisphere for projections undefined behind the sensor plane,
    /// the full sphere otherwise.
    pub fn default_cos_fov(self) -> Real {
        match self {
            Projection::Rectilinear | Projection::Orthographic => 0.0,
            Projection::FTheta | Projection::Equisolid => -1.0,
        }
    }
}

/// Half-line from a camera position through a pixel's viewing direction.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn point_at(&self, depth: Real) -> Vec3 {
        self.origin + self.direction * depth
    }
}

#[derive(Clone, Debug)]
pub struct Camera {
    pub projection: Projection,
    pub position: Vec3,
    /// Rows are `right`, `up`, `backward`.
    pub rotation: Mat3,
    pub resolution: Vec2,
    pub principal: Vec2,
    /// Pixels per sensor unit; y is negative for square pixels (+y up in
    /// camera space, down in image space).
    pub focal: Vec2,
    /// Cosine of the FOV half-angle; -1 disables the cutoff.
    pub cos_fov: Real,
    pub id: String,
    pub group: String,
    distortion: Vec3,
    distortion_max: Real,
}

impl Camera {
    pub fn new(projection: Projection, resolution: Vec2, focal: Vec2) -> Self {
        Camera {
            projection,
            position: Vec3::zeros(),
            rotation: Mat3::identity(),
            principal: resolution / 2.0,
            resolution,
            focal,
            cos_fov: projection.default_cos_fov(),
            id: String::new(),
            group: String::new(),
            distortion: Vec3::zeros(),
            distortion_max: Real::INFINITY,
        }
    }

    // rotation as forward/up/right vectors

    pub fn forward(&self) -> Vec3 {
        -self.backward()
    }

    pub fn backward(&self) -> Vec3 {
        self.rotation.row(2).transpose()
    }

    pub fn up(&self) -> Vec3 {
        self.rotation.row(1).transpose()
    }

    pub fn right(&self) -> Vec3 {
        self.rotation.row(0).transpose()
    }

    /// Set the rotation from an orthonormal right-handed frame. The matrix is
    /// re-unitarized, so the inputs may be slightly off-orthogonal.
    pub fn set_rotation_frame(&mut self, forward: &Vec3, up: &Vec3, right: &Vec3) -> Result<()> {
        if right.cross(up).dot(forward) >= 0.0 {
            return Err(CalibrationError::Rig(format!(
                "camera {}: rotation must be right-handed",
                self.id
            )));
        }
        let mut m = Mat3::zeros();
        m.set_row(0, &right.transpose());
        m.set_row(1, &up.transpose());
        m.set_row(2, &(-forward).transpose());
        let tol = 0.001;
        if ((m * m.transpose()) - Mat3::identity()).abs().max() > tol {
            return Err(CalibrationError::Rig(format!(
                "camera {}: rotation is not close to unitary",
                self.id
            )));
        }
        self.rotation = Rotation3::from_matrix(&m).into_inner();
        Ok(())
    }

    /// Rotation as angle times unit axis.
    pub fn scaled_axis(&self) -> Vec3 {
        Rotation3::from_matrix_unchecked(self.rotation).scaled_axis()
    }

    pub fn set_scaled_axis(&mut self, aa: &Vec3) {
        self.rotation = Rotation3::from_scaled_axis(*aa).into_inner();
    }

    // distortion

    pub fn distortion(&self) -> &Vec3 {
        &self.distortion
    }

    /// Radius beyond which the distortion polynomial stops being monotonic;
    /// [`Camera::distort`] clamps there.
    pub fn distortion_max(&self) -> Real {
        self.distortion_max
    }

    pub fn set_default_distortion(&mut self) {
        self.distortion = Vec3::zeros();
        self.distortion_max = Real::INFINITY;
    }

    pub fn set_distortion(&mut self, distortion: &Vec3) {
        // ignore trailing zeros
        let mut count = distortion.len();
        while distortion[count - 1] == 0.0 {
            count -= 1;
            if count == 0 {
                return self.set_default_distortion();
            }
        }

        // distortion polynomial is r + d0 r^3 + d1 r^5 ...
        // derivative is 1 + 3 d0 r^2 + 5 d1 r^4 ...
        // in y = r^2: 1 + 3 d0 y + 5 d1 y^2 ...
        let mut derivative = vec![1.0; count + 1];
        for (i, d) in distortion.iter().take(count).enumerate() {
            derivative[i + 1] = d * (2 * i + 3) as Real;
        }

        self.distortion = *distortion;
        self.distortion_max = smallest_positive_root(&derivative).sqrt();
    }

    // focal as a scalar (x right, y down, square pixels)

    pub fn set_scalar_focal(&mut self, scalar: Real) {
        self.focal = Vec2::new(scalar, -scalar);
    }

    pub fn scalar_focal(&self) -> Result<Real> {
        if self.focal.x != -self.focal.y {
            return Err(CalibrationError::Rig(format!(
                "camera {}: pixels are not square",
                self.id
            )));
        }
        Ok(self.focal.x)
    }

    // fov, measured in radians from the optical axis

    pub fn set_fov(&mut self, radians: Real) -> Result<()> {
        let cos_fov = radians.cos();
        if cos_fov < self.projection.default_cos_fov() {
            return Err(CalibrationError::Rig(format!(
                "camera {}: fov {radians} exceeds the projection's limit",
                self.id
            )));
        }
        self.cos_fov = cos_fov;
        Ok(())
    }

    pub fn fov(&self) -> Real {
        self.cos_fov.acos()
    }

    pub fn is_default_fov(&self) -> bool {
        self.cos_fov == self.projection.default_cos_fov()
    }

    /// Same camera at a new resolution; principal and focal scale with it.
    pub fn rescale(&self, new_resolution: &Vec2) -> Camera {
        let mut result = self.clone();
        let scale = new_resolution.component_div(&self.resolution);
        result.principal = self.principal.component_mul(&scale);
        result.focal = self.focal.component_mul(&scale);
        result.resolution = *new_resolution;
        result
    }

    // projection

    /// Pixel coordinates of a rig-space point.
    pub fn pixel(&self, rig: &Vec3) -> Vec2 {
        let camera = self.rotation * (rig - self.position);
        let sensor = camera_to_sensor(
            self.projection,
            &self.distortion,
            self.distortion_max,
            &camera,
        );
        self.focal.component_mul(&sensor) + self.principal
    }

    /// Viewing ray of a pixel, inverse of [`Camera::pixel`].
    pub fn rig(&self, pixel: &Vec2) -> Ray {
        let sensor = (pixel - self.principal).component_div(&self.focal);
        let unit = self.sensor_to_camera(&sensor);
        Ray {
            origin: self.position,
            direction: self.rotation.transpose() * unit,
        }
    }

    /// Rig-space point seen at `pixel` at the given depth.
    pub fn rig_at_depth(&self, pixel: &Vec2, depth: Real) -> Vec3 {
        self.rig(pixel).point_at(depth)
    }

    pub fn rig_near_infinity(&self, pixel: &Vec2) -> Vec3 {
        self.rig_at_depth(pixel, NEAR_INFINITY)
    }

    pub fn is_behind(&self, rig: &Vec3) -> bool {
        self.backward().dot(&(rig - self.position)) >= 0.0
    }

    pub fn is_outside_fov(&self, rig: &Vec3) -> bool {
        if self.cos_fov == -1.0 {
            return false;
        }
        if self.cos_fov == 0.0 {
            return self.is_behind(rig);
        }
        let v = rig - self.position;
        let dot = self.forward().dot(&v);
        dot * dot.abs() <= self.cos_fov * self.cos_fov.abs() * v.norm_squared()
    }

    /// True when a pixel lies outside the circle the FOV cone projects onto
    /// the sensor. Always false for a default (uncut) FOV.
    pub fn is_outside_image_circle(&self, pix: &Vec2) -> bool {
        if self.is_default_fov() {
            return false;
        }

        // project a point from the fov cone to find an edge point
        let sin_fov = (1.0 - self.cos_fov * self.cos_fov).sqrt();
        let edge = camera_to_sensor(
            self.projection,
            &self.distortion,
            self.distortion_max,
            &Vec3::new(0.0, sin_fov, -self.cos_fov),
        );

        let sensor = (pix - self.principal).component_div(&self.focal);
        sensor.norm_squared() >= edge.norm_squared()
    }

    pub fn is_outside_sensor(&self, pix: &Vec2) -> bool {
        !(0.0 <= pix.x && pix.x < self.resolution.x && 0.0 <= pix.y && pix.y < self.resolution.y)
    }

    /// Pixel coordinates if the rig-space point falls inside both the FOV and
    /// the sensor rectangle.
    pub fn sees(&self, rig: &Vec3) -> Option<Vec2> {
        if self.is_outside_fov(rig) {
            return None;
        }
        let pix = self.pixel(rig);
        (!self.is_outside_sensor(&pix)).then_some(pix)
    }

    /// Fraction of this camera's frame also covered by `other`, estimated by
    /// probing a 10×10 grid of near-infinity points.
    pub fn overlap(&self, other: &Camera) -> Real {
        const PROBE_COUNT: usize = 10;
        let mut inside = 0;
        for y in 0..PROBE_COUNT {
            for x in 0..PROBE_COUNT {
                let p = Vec2::new(x as Real, y as Real)
                    .component_mul(&self.resolution)
                    / (PROBE_COUNT - 1) as Real;
                if !self.is_outside_image_circle(&p)
                    && other.sees(&self.rig_near_infinity(&p)).is_some()
                {
                    inside += 1;
                }
            }
        }
        inside as Real / (PROBE_COUNT * PROBE_COUNT) as Real
    }

    pub fn distort(&self, r: Real) -> Real {
        distort(&self.distortion, self.distortion_max, r)
    }

    /// Invert [`Camera::distort`] by Newton iteration. Inputs beyond the
    /// clamped range return the clamp radius.
    pub fn undistort(&self, y: Real) -> Real {
        if self.distortion == Vec3::zeros() {
            return y;
        }

        if y >= self.distort(self.distortion_max) {
            return self.distortion_max;
        }

        let smidgen = 1.0 / NEAR_INFINITY;
        const MAX_STEPS: usize = 10;

        let mut x0 = 0.0;
        let mut y0 = 0.0;
        let mut dy0 = 1.0;
        for _ in 0..MAX_STEPS {
            let x1 = (y - y0) / dy0 + x0;
            let y1 = self.distort(x1);
            if (y1 - y).abs() < smidgen {
                return x1;
            }
            let dy1 = (self.distort(x1 + smidgen) - y1) / smidgen;
            debug_assert!(dy1 >= 0.0, "went past a maximum");
            x0 = x1;
            y0 = y1;
            dy0 = dy1;
        }
        x0
    }

    // unit camera-space vector from normalized sensor coordinates
    fn sensor_to_camera(&self, sensor: &Vec2) -> Vec3 {
        let squared_norm = sensor.norm_squared();
        if squared_norm == 0.0 {
            // straight down the optical axis
            return Vec3::new(0.0, 0.0, -1.0);
        }
        let norm = squared_norm.sqrt();
        let r = self.undistort(norm);
        let theta = match self.projection {
            Projection::FTheta => r,
            Projection::Rectilinear => r.atan(),
            // asin is undefined outside [-1, 1]
            Projection::Equisolid => {
                if r <= 2.0 {
                    2.0 * (r / 2.0).asin()
                } else {
                    std::f64::consts::PI
                }
            }
            Projection::Orthographic => {
                if r <= 1.0 {
                    r.asin()
                } else {
                    std::f64::consts::FRAC_PI_2
                }
            }
        };
        let xy = sensor * (theta.sin() / norm);
        Vec3::new(xy.x, xy.y, -theta.cos())
    }
}

/// `1 + y (d0 + y (d1 + y d2))` with `y = r²`, the distortion polynomial
/// divided by `r`. Generic so it runs under the solver's dual numbers.
pub fn distort_factor<S: RealField>(distortion: &Vector3<S>, r_squared: S) -> S {
    let mut result = distortion[2].clone();
    result = distortion[1].clone() + r_squared.clone() * result;
    result = distortion[0].clone() + r_squared.clone() * result;
    S::one() + r_squared * result
}

/// `r + d0 r³ + d1 r⁵ + d2 r⁷`, clamped at the monotonic maximum `r_max`.
pub fn distort<S: RealField>(distortion: &Vector3<S>, r_max: S, r: S) -> S {
    let r = if r > r_max { r_max } else { r };
    distort_factor(distortion, r.clone() * r.clone()) * r
}

/// Project a camera-space direction onto the distorted sensor plane.
pub fn camera_to_sensor<S: RealField>(
    projection: Projection,
    distortion: &Vector3<S>,
    r_max: S,
    camera: &Vector3<S>,
) -> Vector2<S> {
    let head = Vector2::new(camera.x.clone(), camera.y.clone());
    let xy = head.norm();
    if xy == S::zero() {
        // straight down the optical axis
        return Vector2::zeros();
    }
    match projection {
        Projection::FTheta => {
            // r = theta = atan2(|xy|, -z)
            let r = xy.clone().atan2(-camera.z.clone());
            head * (distort(distortion, r_max, r) / xy)
        }
        Projection::Rectilinear => {
            // r = tan(theta) = |xy| / -z; behind the sensor plane the point
            // is outside the fov, so land it far outside the sensor
            let two = S::one() + S::one();
            let neg_z = -camera.z.clone();
            let r = if neg_z <= S::zero() {
                (S::pi() / two).tan()
            } else {
                xy.clone() / neg_z
            };
            head * (distort(distortion, r_max, r) / xy)
        }
        Projection::Equisolid => {
            // r = 2 sin(theta / 2) = 2 sqrt((1 + z / |xyz|) / 2)
            let two = S::one() + S::one();
            let r = two.clone()
                * ((S::one() + camera.z.clone() / camera.norm()) / two).sqrt();
            head * (distort(distortion, r_max, r) / xy)
        }
        Projection::Orthographic => {
            // r = sin(theta) = |xy| / |xyz|
            let pre = if camera.z < S::zero() {
                head / camera.norm()
            } else {
                head / xy
            };
            let factor = distort_factor(distortion, pre.norm_squared());
            pre * factor
        }
    }
}

/// Smallest positive root of a polynomial given coefficients from the
/// constant term up; infinity if there is none. The constant term must be
/// positive. Bracketing scan followed by bisection.
fn smallest_positive_root(coeffs: &[Real]) -> Real {
    let eval = |x: Real| {
        coeffs
            .iter()
            .rev()
            .fold(0.0, |acc: Real, c| acc * x + c)
    };

    let lead = coeffs[coeffs.len() - 1];
    if coeffs.len() < 2 || lead == 0.0 {
        return Real::INFINITY;
    }
    // Cauchy bound on the magnitude of any root
    let bound = 1.0
        + coeffs[..coeffs.len() - 1]
            .iter()
            .map(|c| (c / lead).abs())
            .fold(0.0, Real::max);

    const SAMPLES: usize = 4096;
    let step = bound / SAMPLES as Real;
    let mut lo = 0.0;
    let mut hi = 0.0;
    let mut found = false;
    for i in 1..=SAMPLES {
        let x = step * i as Real;
        if eval(x) <= 0.0 {
            lo = x - step;
            hi = x;
            found = true;
            break;
        }
    }
    if !found {
        return Real::INFINITY;
    }
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if eval(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera(projection: Projection) -> Camera {
        let mut camera = Camera::new(
            projection,
            Vec2::new(2048.0, 2048.0),
            Vec2::new(1200.0, -1200.0),
        );
        camera.id = "cam0".to_string();
        camera.position = Vec3::new(0.1, -0.2, 0.05);
        camera.set_scaled_axis(&Vec3::new(0.02, 0.7, -0.1));
        camera
    }

    #[test]
    fn pixel_ray_round_trip_all_projections() {
        for projection in [
            Projection::FTheta,
            Projection::Rectilinear,
            Projection::Equisolid,
            Projection::Orthographic,
        ] {
            let mut camera = test_camera(projection);
            camera.set_distortion(&Vec3::new(0.01, -0.002, 0.0));
            for pix in [
                Vec2::new(1024.0, 1024.0),
                Vec2::new(700.0, 1400.0),
                Vec2::new(1300.0, 800.0),
            ] {
                let world = camera.rig_at_depth(&pix, 7.5);
                let back = camera.pixel(&world);
                // undistort stops at |distort(r) - y| < 1e-4 sensor units
                assert_relative_eq!(pix, back, epsilon = 2e-2);
            }
        }
    }

    #[test]
    fn distort_undistort_round_trip() {
        let mut camera = test_camera(Projection::FTheta);
        camera.set_distortion(&Vec3::new(0.06, -0.004, 0.0));
        assert!(camera.distortion_max().is_finite());
        for r in [0.0, 0.1, 0.3, 0.5] {
            assert_relative_eq!(camera.undistort(camera.distort(r)), r, epsilon = 1e-3);
        }
        // past the clamp the inverse saturates
        let beyond = camera.distort(camera.distortion_max()) + 1.0;
        assert_relative_eq!(camera.undistort(beyond), camera.distortion_max());
    }

    #[test]
    fn zero_distortion_has_infinite_max() {
        let mut camera = test_camera(Projection::FTheta);
        camera.set_distortion(&Vec3::zeros());
        assert!(camera.distortion_max().is_infinite());
        // trailing zeros are ignored
        camera.set_distortion(&Vec3::new(0.0, 0.0, 0.0));
        assert!(camera.distortion_max().is_infinite());
        assert_relative_eq!(camera.distort(0.7), 0.7);
    }

    #[test]
    fn negative_leading_coefficient_bounds_radius() {
        let mut camera = test_camera(Projection::FTheta);
        camera.set_distortion(&Vec3::new(-0.1, 0.0, 0.0));
        // derivative 1 - 0.3 y has root y = 10/3
        assert_relative_eq!(
            camera.distortion_max(),
            (10.0_f64 / 3.0).sqrt(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn scalar_focal_requires_square_pixels() {
        let mut camera = test_camera(Projection::Rectilinear);
        camera.set_scalar_focal(900.0);
        assert_relative_eq!(camera.scalar_focal().unwrap(), 900.0);
        camera.focal = Vec2::new(900.0, -800.0);
        assert!(camera.scalar_focal().is_err());
    }

    #[test]
    fn sees_rejects_points_behind_rectilinear() {
        let camera = test_camera(Projection::Rectilinear);
        let ahead = camera.position + camera.forward() * 5.0;
        let behind = camera.position - camera.forward() * 5.0;
        assert!(camera.sees(&ahead).is_some());
        assert!(camera.sees(&behind).is_none());
    }

    #[test]
    fn image_circle_matches_fov() {
        let mut camera = test_camera(Projection::FTheta);
        camera.set_fov(1.0).unwrap();
        let principal = camera.principal;
        assert!(!camera.is_outside_image_circle(&principal));
        // a pixel projected from just inside the fov cone stays inside
        let inside = camera.pixel(&(camera.position + camera.forward() * 10.0));
        assert!(!camera.is_outside_image_circle(&inside));
    }

    #[test]
    fn rescale_preserves_rays() {
        let camera = test_camera(Projection::FTheta);
        let half = camera.rescale(&Vec2::new(1024.0, 1024.0));
        let pix = Vec2::new(640.0, 700.0);
        let full = camera.rig(&(pix * 2.0)).direction;
        let scaled = half.rig(&pix).direction;
        assert_relative_eq!(full, scaled, epsilon = 1e-12);
    }

    #[test]
    fn overlap_of_identical_cameras_is_full() {
        let camera = test_camera(Projection::FTheta);
        assert_relative_eq!(camera.overlap(&camera), 1.0);
    }

    #[test]
    fn rotation_frame_round_trip() {
        let mut camera = test_camera(Projection::FTheta);
        let (f, u, r) = (camera.forward(), camera.up(), camera.right());
        let rotation = camera.rotation;
        camera
            .set_rotation_frame(&f, &u, &r)
            .expect("orthonormal frame");
        assert_relative_eq!(camera.rotation, rotation, epsilon = 1e-9);
        // left-handed frames are rejected
        assert!(camera.set_rotation_frame(&f, &u, &-r).is_err());
    }
}
