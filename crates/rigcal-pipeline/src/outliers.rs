//! Match outlier rejection.

use std::collections::BTreeMap;

use log::{debug, info};

use rigcal_core::{percentile, Camera, ImageId, Real, Result, RigIndex, RigLayout};
use rigcal_match::Overlap;
use rigcal_optim::{FeatureMap, Trace};

use crate::reproj::reprojection_errors;

/// Drop matches whose reprojection error is anomalous for their camera.
///
/// Each camera's squared errors are summarized by their median; a match
/// survives only when both of its endpoints fall below that camera's median
/// times `outlier_factor`. Cameras with no intra-frame matches have a NaN
/// median, which rejects nothing.
#[allow(clippy::too_many_arguments)]
pub fn remove_outliers(
    overlaps: &mut [Overlap],
    feature_map: &FeatureMap,
    traces: &[Trace],
    cameras: &[Camera],
    rig_index: &RigIndex,
    layout: RigLayout,
    outlier_factor: Real,
    force_in_front: bool,
) -> Result<()> {
    let errors = reprojection_errors(
        overlaps,
        feature_map,
        traces,
        cameras,
        rig_index,
        layout,
        force_in_front,
    )?;
    let medians: Vec<Real> = errors.iter().map(|e| percentile(e, 0.5)).collect();

    let mut cursors = vec![0usize; cameras.len()];
    let mut outliers: BTreeMap<ImageId, usize> = BTreeMap::new();
    let mut total = 0usize;
    let mut inlier_total = 0usize;

    for overlap in overlaps.iter_mut() {
        if !overlap.is_intra_frame(layout) {
            continue;
        }
        let indexes = [
            rig_index.camera_index_for_image(&overlap.images[0], layout)?,
            rig_index.camera_index_for_image(&overlap.images[1], layout)?,
        ];
        total += overlap.matches.len();
        let mut kept = 0usize;
        for m in 0..overlap.matches.len() {
            let mut inlier = true;
            for k in 0..2 {
                let i = indexes[k];
                let error = errors[i][cursors[i]];
                cursors[i] += 1;
                if !(error < medians[i] * outlier_factor) {
                    inlier = false;
                }
            }
            if inlier {
                overlap.matches[kept] = overlap.matches[m];
                kept += 1;
            } else {
                for image in &overlap.images {
                    *outliers.entry(image.clone()).or_insert(0) += 1;
                }
            }
        }
        overlap.matches.truncate(kept);
        inlier_total += kept;
    }

    // every computed error belongs to exactly one match endpoint
    debug_assert!(cursors
        .iter()
        .zip(&errors)
        .all(|(&cursor, e)| cursor == e.len()));

    for (image, count) in &outliers {
        debug!("image {image} has {count} outliers");
    }
    info!("{inlier_total} of {total} matches were inliers");
    Ok(())
}
