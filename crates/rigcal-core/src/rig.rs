//! Rig document I/O.
//!
//! A rig file is `{"cameras": [...], "comments": [...]}`. Camera entries
//! store the rotation as `forward`/`up`/`right` row vectors; `principal`,
//! `distortion`, `fov` and `group` are optional and omitted when they hold
//! their defaults.

use std::collections::HashMap;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::camera::{Camera, Projection};
use crate::error::{CalibrationError, Result};
use crate::image_id::{ImageId, RigLayout};
use crate::math::{Real, Vec2, Vec3};

pub type Rig = Vec<Camera>;

#[derive(Serialize, Deserialize)]
struct CameraDoc {
    version: Real,
    #[serde(rename = "type")]
    projection: Projection,
    origin: [Real; 3],
    forward: [Real; 3],
    up: [Real; 3],
    right: [Real; 3],
    resolution: [Real; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    principal: Option<[Real; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distortion: Option<Vec<Real>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fov: Option<Real>,
    focal: [Real; 2],
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RigDoc {
    cameras: Vec<CameraDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    comments: Vec<String>,
}

impl TryFrom<CameraDoc> for Camera {
    type Error = CalibrationError;

    fn try_from(doc: CameraDoc) -> Result<Camera> {
        if doc.version < 1.0 {
            return Err(CalibrationError::Rig(format!(
                "camera {}: unsupported version {}",
                doc.id, doc.version
            )));
        }
        let mut camera = Camera::new(
            doc.projection,
            Vec2::from(doc.resolution),
            Vec2::from(doc.focal),
        );
        camera.id = doc.id;
        camera.position = Vec3::from(doc.origin);
        camera.set_rotation_frame(
            &Vec3::from(doc.forward),
            &Vec3::from(doc.up),
            &Vec3::from(doc.right),
        )?;
        if let Some(principal) = doc.principal {
            camera.principal = Vec2::from(principal);
        }
        if let Some(entries) = doc.distortion {
            if entries.len() > 3 {
                return Err(CalibrationError::Rig(format!(
                    "camera {}: distortion has {} coefficients, at most 3 supported",
                    camera.id,
                    entries.len()
                )));
            }
            let mut distortion = Vec3::zeros();
            for (i, d) in entries.iter().enumerate() {
                distortion[i] = *d;
            }
            camera.set_distortion(&distortion);
        }
        if let Some(fov) = doc.fov {
            camera.set_fov(fov)?;
        }
        if let Some(group) = doc.group {
            camera.group = group;
        }
        Ok(camera)
    }
}

impl From<&Camera> for CameraDoc {
    fn from(camera: &Camera) -> CameraDoc {
        CameraDoc {
            version: 1.0,
            projection: camera.projection,
            origin: camera.position.into(),
            forward: camera.forward().into(),
            up: camera.up().into(),
            right: camera.right().into(),
            resolution: camera.resolution.into(),
            principal: (camera.principal != camera.resolution / 2.0)
                .then(|| camera.principal.into()),
            distortion: (*camera.distortion() != Vec3::zeros())
                .then(|| camera.distortion().iter().copied().collect()),
            fov: (!camera.is_default_fov()).then(|| camera.fov()),
            focal: camera.focal.into(),
            id: camera.id.clone(),
            group: (!camera.group.is_empty()).then(|| camera.group.clone()),
        }
    }
}

pub fn parse_rig(json: &str) -> Result<Rig> {
    let doc: RigDoc = serde_json::from_str(json)?;
    doc.cameras.into_iter().map(Camera::try_from).collect()
}

pub fn load_rig(path: impl AsRef<Path>) -> Result<Rig> {
    let json = std::fs::read_to_string(path)?;
    parse_rig(&json)
}

pub fn save_rig(path: impl AsRef<Path>, rig: &Rig, comments: &[String]) -> Result<()> {
    let doc = RigDoc {
        cameras: rig.iter().map(CameraDoc::from).collect(),
        comments: comments.to_vec(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

/// Index of each camera id, and of each group's last camera, within the rig.
#[derive(Clone, Debug, Default)]
pub struct RigIndex {
    pub by_id: HashMap<String, usize>,
    pub by_group: HashMap<String, usize>,
}

impl RigIndex {
    pub fn new(rig: &Rig) -> Self {
        let mut index = RigIndex::default();
        for (i, camera) in rig.iter().enumerate() {
            index.by_id.insert(camera.id.clone(), i);
            // last camera in group wins
            index.by_group.insert(camera.group.clone(), i);
        }
        index
    }

    pub fn camera_index(&self, id: &str) -> Result<usize> {
        self.by_id
            .get(id)
            .copied()
            .ok_or_else(|| CalibrationError::Rig(format!("camera id {id} not found")))
    }

    /// Rig index of the camera an image id encodes under the given layout.
    pub fn camera_index_for_image(&self, image: &ImageId, layout: RigLayout) -> Result<usize> {
        let id = image.camera_id(layout).ok_or_else(|| {
            CalibrationError::Rig(format!("image id {image} does not encode a camera id"))
        })?;
        self.camera_index(&id)
    }
}

fn perturbed(rng: &mut impl Rng, value: Real, amount: Real) -> Real {
    value + amount * 2.0 * (rng.random::<Real>() - 0.5)
}

/// Add uniform noise to camera parameters for synthetic experiments. The
/// first camera's position and rotation stay fixed; it is the reference.
pub fn perturb_cameras(
    cameras: &mut Rig,
    rng: &mut impl Rng,
    position_amount: Real,
    rotation_amount: Real,
    principal_amount: Real,
    focal_amount: Real,
) -> Result<()> {
    for (i, camera) in cameras.iter_mut().enumerate() {
        if i != 0 {
            for k in 0..3 {
                camera.position[k] = perturbed(rng, camera.position[k], position_amount);
            }
            let mut rotation = camera.scaled_axis();
            for k in 0..3 {
                rotation[k] = perturbed(rng, rotation[k], rotation_amount);
            }
            camera.set_scaled_axis(&rotation);
        }
        for k in 0..2 {
            camera.principal[k] = perturbed(rng, camera.principal[k], principal_amount);
        }
        if focal_amount != 0.0 {
            let focal = perturbed(rng, camera.scalar_focal()?, focal_amount);
            camera.set_scalar_focal(focal);
        }
    }
    Ok(())
}
