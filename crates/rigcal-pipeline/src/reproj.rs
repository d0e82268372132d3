//! Per-camera reprojection errors of the pairwise matches.
//!
//! Errors are collected per camera, in match order, as squared pixel norms.
//! [`crate::outliers`] walks the same overlaps in the same order and
//! consumes the errors with per-camera cursors, so the iteration here is
//! load-bearing: only intra-frame overlaps contribute, and every match
//! pushes exactly one error for each of its two endpoint cameras.

use rigcal_core::{CalibrationError, Camera, ImageId, Real, Result, RigIndex, RigLayout};
use rigcal_match::Overlap;
use rigcal_optim::{triangulate, Feature, FeatureMap, Observation, Trace};

fn lookup_feature<'a>(
    feature_map: &'a FeatureMap,
    image: &ImageId,
    index: usize,
) -> Result<&'a Feature> {
    feature_map
        .get(image)
        .and_then(|features| features.get(index))
        .ok_or_else(|| {
            CalibrationError::InvariantViolation(format!(
                "match references missing feature {image}:{index}"
            ))
        })
}

/// Squared reprojection errors per camera, over the matches of intra-frame
/// overlaps. A traced match is measured against its trace's position; an
/// untraced one against an on-the-fly triangulation of the pair.
pub fn reprojection_errors(
    overlaps: &[Overlap],
    feature_map: &FeatureMap,
    traces: &[Trace],
    cameras: &[Camera],
    rig_index: &RigIndex,
    layout: RigLayout,
    force_in_front: bool,
) -> Result<Vec<Vec<Real>>> {
    let mut errors = vec![Vec::new(); cameras.len()];
    for overlap in overlaps {
        if !overlap.is_intra_frame(layout) {
            continue;
        }
        let indexes = [
            rig_index.camera_index_for_image(&overlap.images[0], layout)?,
            rig_index.camera_index_for_image(&overlap.images[1], layout)?,
        ];
        for m in &overlap.matches {
            let features = [
                lookup_feature(feature_map, &overlap.images[0], m.corners[0])?,
                lookup_feature(feature_map, &overlap.images[1], m.corners[1])?,
            ];
            // matched features always land in the same trace during assembly
            if features[0].trace != features[1].trace {
                return Err(CalibrationError::InvariantViolation(format!(
                    "matched features {}:{} and {}:{} are in different traces",
                    overlap.images[0], m.corners[0], overlap.images[1], m.corners[1]
                )));
            }
            let rig = match features[0].trace {
                Some(t) => {
                    traces
                        .get(t)
                        .ok_or_else(|| {
                            CalibrationError::InvariantViolation(format!(
                                "feature references missing trace {t}"
                            ))
                        })?
                        .position
                }
                None => {
                    let observations = [
                        Observation {
                            camera: &cameras[indexes[0]],
                            pixel: features[0].position,
                        },
                        Observation {
                            camera: &cameras[indexes[1]],
                            pixel: features[1].position,
                        },
                    ];
                    triangulate(&observations, force_in_front)
                }
            };
            for k in 0..2 {
                let pixel = cameras[indexes[k]].pixel(&rig);
                errors[indexes[k]].push((pixel - features[k].position).norm_squared());
            }
        }
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigcal_core::{Projection, Vec2, Vec3};
    use rigcal_match::Match;

    fn camera(id: &str, position: Vec3) -> Camera {
        let mut camera = Camera::new(
            Projection::Rectilinear,
            Vec2::new(1280.0, 1024.0),
            Vec2::new(1000.0, -1000.0),
        );
        camera.id = id.to_string();
        camera.position = position;
        camera
    }

    fn setup() -> (Vec<Camera>, FeatureMap, Vec<Overlap>) {
        let cameras = vec![
            camera("cam0", Vec3::new(0.0, 0.0, 0.0)),
            camera("cam1", Vec3::new(0.5, 0.0, 0.0)),
        ];
        let world = Vec3::new(0.2, -0.1, -5.0);
        let mut feature_map = FeatureMap::new();
        for c in &cameras {
            feature_map.insert(
                ImageId::new(format!("{}/000000", c.id)),
                vec![Feature {
                    position: c.pixel(&world),
                    trace: None,
                }],
            );
        }
        let mut overlap = Overlap::new(ImageId::from("cam0/000000"), ImageId::from("cam1/000000"));
        overlap.matches.push(Match {
            score: 1.0,
            corners: [0, 0],
        });
        (cameras, feature_map, vec![overlap])
    }

    #[test]
    fn exact_observations_have_tiny_errors() {
        let (cameras, feature_map, overlaps) = setup();
        let rig_index = RigIndex::new(&cameras);
        let errors = reprojection_errors(
            &overlaps,
            &feature_map,
            &[],
            &cameras,
            &rig_index,
            RigLayout::DirPerCamera,
            false,
        )
        .unwrap();
        assert_eq!(errors[0].len(), 1);
        assert_eq!(errors[1].len(), 1);
        assert!(errors[0][0] < 1e-4);
        assert!(errors[1][0] < 1e-4);
    }

    #[test]
    fn traced_matches_use_the_trace_position() {
        let (cameras, mut feature_map, overlaps) = setup();
        for features in feature_map.values_mut() {
            features[0].trace = Some(0);
        }
        let mut trace = Trace::new();
        // a trace position two pixels off in x for cam0
        trace.position = Vec3::new(0.2, -0.1, -5.0) + Vec3::new(0.01, 0.0, 0.0);
        let rig_index = RigIndex::new(&cameras);
        let errors = reprojection_errors(
            &overlaps,
            &feature_map,
            &[trace],
            &cameras,
            &rig_index,
            RigLayout::DirPerCamera,
            false,
        )
        .unwrap();
        assert!(errors[0][0] > 1.0);
    }

    #[test]
    fn mismatched_traces_violate_the_invariant() {
        let (cameras, mut feature_map, overlaps) = setup();
        feature_map
            .get_mut(&ImageId::from("cam0/000000"))
            .unwrap()[0]
            .trace = Some(0);
        let rig_index = RigIndex::new(&cameras);
        let err = reprojection_errors(
            &overlaps,
            &feature_map,
            &[Trace::new()],
            &cameras,
            &rig_index,
            RigLayout::DirPerCamera,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, CalibrationError::InvariantViolation(_)));
    }
}
