//! Residual factors for `tiny-solver`.
//!
//! Every factor is generic over `nalgebra::RealField` so the optimizer can
//! evaluate it with dual numbers and differentiate automatically. The
//! distortion clamp radius is captured as plain data at construction time;
//! it is held constant within one solve and recomputed when the cameras are
//! rebuilt between passes.

use nalgebra::{dvector, DVector, Matrix3, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;

use rigcal_core::{
    camera_to_sensor, cartesian_from_spherical, rotate_scaled_axis, Camera, Mat3, Projection,
    Real, Vec2, Vec3,
};

fn real<T: RealField>(x: Real) -> T {
    T::from_f64(x).unwrap()
}

fn vec2<T: RealField>(v: &Vec2) -> Vector2<T> {
    Vector2::new(real(v.x), real(v.y))
}

fn vec3<T: RealField>(v: &Vec3) -> Vector3<T> {
    Vector3::new(real(v.x), real(v.y), real(v.z))
}

fn block3<T: RealField>(block: &DVector<T>) -> Vector3<T> {
    Vector3::new(block[0].clone(), block[1].clone(), block[2].clone())
}

/// Pixel error of projecting `world` through a camera rebuilt from parameter
/// values, scaled by `1 / sqrt(weight)`.
#[allow(clippy::too_many_arguments)]
fn projection_residual<T: RealField>(
    projection: Projection,
    position: &Vector3<T>,
    rotation: &Vector3<T>,
    principal: &Vector2<T>,
    focal: &Vector2<T>,
    distortion: &Vector3<T>,
    distortion_max: T,
    world: &Vector3<T>,
    pixel: &Vec2,
    weight: Real,
) -> DVector<T> {
    let camera = rotate_scaled_axis(rotation, &(world - position));
    let sensor = camera_to_sensor(projection, distortion, distortion_max, &camera);
    let projected = focal.component_mul(&sensor) + principal;
    let scale = real::<T>(1.0 / weight.sqrt());
    dvector![
        (projected.x.clone() - real::<T>(pixel.x)) * scale.clone(),
        (projected.y.clone() - real::<T>(pixel.y)) * scale,
    ]
}

/// Reprojection residual with free position, rotation (scaled axis),
/// principal, scalar focal, distortion and world point.
///
/// Parameter blocks: `[position(3), rotation(3), principal(2), focal(1),
/// distortion(3), world(3)]`.
#[derive(Clone, Debug)]
pub struct ReprojectionFactor {
    pub projection: Projection,
    pub pixel: Vec2,
    pub distortion_max: Real,
    pub weight: Real,
}

impl<T: RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 6, "expected 6 parameter blocks");
        let position = block3(&params[0]);
        let rotation = block3(&params[1]);
        let principal = Vector2::new(params[2][0].clone(), params[2][1].clone());
        let focal = Vector2::new(params[3][0].clone(), -params[3][0].clone());
        let distortion = block3(&params[4]);
        let world = block3(&params[5]);
        projection_residual(
            self.projection,
            &position,
            &rotation,
            &principal,
            &focal,
            &distortion,
            real(self.distortion_max),
            &world,
            &self.pixel,
            self.weight,
        )
    }
}

/// Reprojection residual for the relative camera. Its position is
/// `reference + spherical(radius, theta, phi)` with the radius held fixed,
/// which pins the rig scale while positions are free.
///
/// Parameter blocks: `[spherical(2: theta, phi), rotation(3), principal(2),
/// focal(1), distortion(3), world(3)]`.
#[derive(Clone, Debug)]
pub struct SphericalReprojectionFactor {
    pub projection: Projection,
    pub pixel: Vec2,
    pub distortion_max: Real,
    pub weight: Real,
    pub radius: Real,
    pub reference_position: Vec3,
}

impl<T: RealField> Factor<T> for SphericalReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 6, "expected 6 parameter blocks");
        let position = vec3::<T>(&self.reference_position)
            + cartesian_from_spherical(
                real(self.radius),
                params[0][0].clone(),
                params[0][1].clone(),
            );
        let rotation = block3(&params[1]);
        let principal = Vector2::new(params[2][0].clone(), params[2][1].clone());
        let focal = Vector2::new(params[3][0].clone(), -params[3][0].clone());
        let distortion = block3(&params[4]);
        let world = block3(&params[5]);
        projection_residual(
            self.projection,
            &position,
            &rotation,
            &principal,
            &focal,
            &distortion,
            real(self.distortion_max),
            &world,
            &self.pixel,
            self.weight,
        )
    }
}

/// Triangulation residual against a fixed camera.
///
/// The variable is `inv = world / |world|²` rather than the world point: the
/// variable is then proportional to disparity, and overshooting past the
/// cameras requires crossing through infinity instead of through zero.
///
/// Parameter blocks: `[inv(3)]`.
#[derive(Clone, Debug)]
pub struct TriangulationFactor {
    projection: Projection,
    position: Vec3,
    rotation: Mat3,
    principal: Vec2,
    focal: Vec2,
    distortion: Vec3,
    distortion_max: Real,
    pixel: Vec2,
}

impl TriangulationFactor {
    pub fn new(camera: &Camera, pixel: Vec2) -> Self {
        TriangulationFactor {
            projection: camera.projection,
            position: camera.position,
            rotation: camera.rotation,
            principal: camera.principal,
            focal: camera.focal,
            distortion: *camera.distortion(),
            distortion_max: camera.distortion_max(),
            pixel,
        }
    }
}

impl<T: RealField> Factor<T> for TriangulationFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 1, "expected the inverse-point block");
        let inv = block3(&params[0]);
        let world = &inv / inv.norm_squared();

        let rotation: Matrix3<T> = self.rotation.map(real);
        let camera = rotation * (world - vec3::<T>(&self.position));
        let sensor = camera_to_sensor(
            self.projection,
            &vec3::<T>(&self.distortion),
            real(self.distortion_max),
            &camera,
        );
        let projected = vec2::<T>(&self.focal).component_mul(&sensor) + vec2::<T>(&self.principal);
        dvector![
            projected.x.clone() - real::<T>(self.pixel.x),
            projected.y.clone() - real::<T>(self.pixel.y),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rigcal_core::spherical_from_cartesian;

    fn test_camera() -> Camera {
        let mut camera = Camera::new(
            Projection::FTheta,
            Vec2::new(2048.0, 2048.0),
            Vec2::new(1200.0, -1200.0),
        );
        camera.position = Vec3::new(0.2, -0.1, 0.0);
        camera.set_scaled_axis(&Vec3::new(0.05, -0.3, 0.1));
        camera.set_distortion(&Vec3::new(0.01, -0.001, 0.0));
        camera
    }

    #[test]
    fn reprojection_residual_vanishes_at_ground_truth() {
        let camera = test_camera();
        let world = camera.rig_at_depth(&Vec2::new(900.0, 1100.0), 6.0);
        let pixel = camera.pixel(&world);

        let factor = ReprojectionFactor {
            projection: camera.projection,
            pixel,
            distortion_max: camera.distortion_max(),
            weight: 1.0,
        };
        let aa = camera.scaled_axis();
        let params = vec![
            dvector![camera.position.x, camera.position.y, camera.position.z],
            dvector![aa.x, aa.y, aa.z],
            dvector![camera.principal.x, camera.principal.y],
            dvector![camera.focal.x],
            dvector![
                camera.distortion().x,
                camera.distortion().y,
                camera.distortion().z
            ],
            dvector![world.x, world.y, world.z],
        ];
        let residual: DVector<f64> = factor.residual_func(&params);
        assert_relative_eq!(residual[0], 0.0, epsilon = 1e-4);
        assert_relative_eq!(residual[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn weight_scales_residual() {
        let camera = test_camera();
        let world = camera.rig_at_depth(&Vec2::new(900.0, 1100.0), 6.0);
        let pixel = camera.pixel(&world) + Vec2::new(2.0, 0.0);

        let aa = camera.scaled_axis();
        let params = vec![
            dvector![camera.position.x, camera.position.y, camera.position.z],
            dvector![aa.x, aa.y, aa.z],
            dvector![camera.principal.x, camera.principal.y],
            dvector![camera.focal.x],
            dvector![
                camera.distortion().x,
                camera.distortion().y,
                camera.distortion().z
            ],
            dvector![world.x, world.y, world.z],
        ];
        let unit = ReprojectionFactor {
            projection: camera.projection,
            pixel,
            distortion_max: camera.distortion_max(),
            weight: 1.0,
        };
        let quartered = ReprojectionFactor {
            weight: 4.0,
            ..unit.clone()
        };
        let a: DVector<f64> = unit.residual_func(&params);
        let b: DVector<f64> = quartered.residual_func(&params);
        assert_relative_eq!(a[0], 2.0 * b[0], epsilon = 1e-9);
    }

    #[test]
    fn spherical_position_reconstruction_matches() {
        let camera = test_camera();
        let reference = Vec3::new(-0.1, 0.05, 0.02);
        let relative = camera.position - reference;
        let sph = spherical_from_cartesian(&relative);

        let world = camera.rig_at_depth(&Vec2::new(1200.0, 950.0), 4.0);
        let pixel = camera.pixel(&world);

        let factor = SphericalReprojectionFactor {
            projection: camera.projection,
            pixel,
            distortion_max: camera.distortion_max(),
            weight: 1.0,
            radius: sph.x,
            reference_position: reference,
        };
        let aa = camera.scaled_axis();
        let params = vec![
            dvector![sph.y, sph.z],
            dvector![aa.x, aa.y, aa.z],
            dvector![camera.principal.x, camera.principal.y],
            dvector![camera.focal.x],
            dvector![
                camera.distortion().x,
                camera.distortion().y,
                camera.distortion().z
            ],
            dvector![world.x, world.y, world.z],
        ];
        let residual: DVector<f64> = factor.residual_func(&params);
        assert_relative_eq!(residual[0], 0.0, epsilon = 1e-4);
        assert_relative_eq!(residual[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn triangulation_residual_vanishes_at_true_point() {
        let camera = test_camera();
        let world = camera.rig_at_depth(&Vec2::new(800.0, 1200.0), 5.0);
        let pixel = camera.pixel(&world);
        let factor = TriangulationFactor::new(&camera, pixel);
        let inv = world / world.norm_squared();
        let params = vec![dvector![inv.x, inv.y, inv.z]];
        let residual: DVector<f64> = factor.residual_func(&params);
        assert_relative_eq!(residual[0], 0.0, epsilon = 1e-4);
        assert_relative_eq!(residual[1], 0.0, epsilon = 1e-4);
    }
}
