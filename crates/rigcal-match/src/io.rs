//! Matches document I/O.
//!
//! ```json
//! {
//!   "images": { "<camera>/<frame>.<ext>": [{"x": ..., "y": ...}, ...] },
//!   "all_matches": [{
//!     "image1": ..., "image2": ...,
//!     "matches": [{"idx1": ..., "idx2": ..., "score": ...}]
//!   }]
//! }
//! ```
//!
//! Keys follow the configured [`RigLayout`]; entries for cameras not in the
//! rig are ignored with a log line, which lets one matches file serve rig
//! subsets.

use std::collections::BTreeMap;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use rigcal_core::{CalibrationError, ImageId, Real, Result, RigIndex, RigLayout, Vec2};

use crate::corner::Corner;
use crate::matcher::{Match, Overlap};

#[derive(Serialize, Deserialize)]
struct KeypointDoc {
    x: Real,
    y: Real,
}

#[derive(Serialize, Deserialize)]
struct MatchDoc {
    idx1: usize,
    idx2: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<Real>,
}

#[derive(Serialize, Deserialize)]
struct OverlapDoc {
    image1: ImageId,
    image2: ImageId,
    matches: Vec<MatchDoc>,
}

#[derive(Serialize, Deserialize)]
struct MatchesDoc {
    all_matches: Vec<OverlapDoc>,
    images: BTreeMap<ImageId, Vec<KeypointDoc>>,
}

/// Corner positions keyed by image id.
pub type FeaturePositions = BTreeMap<ImageId, Vec<Vec2>>;

fn image_id_for_camera(layout: RigLayout, camera_id: &str, frame: &str, ext: &str) -> ImageId {
    let id = ImageId::from_parts(layout, camera_id, frame);
    ImageId::new(format!("{id}{ext}"))
}

/// Write corners and overlaps, mapping camera ids to image paths for the
/// given frame. `ext` includes the leading dot.
pub fn save_matches(
    path: impl AsRef<Path>,
    all_corners: &BTreeMap<String, Vec<Corner>>,
    overlaps: &[Overlap],
    layout: RigLayout,
    frame: &str,
    ext: &str,
) -> Result<()> {
    let images = all_corners
        .iter()
        .map(|(camera_id, corners)| {
            let id = image_id_for_camera(layout, camera_id, frame, ext);
            let keypoints = corners
                .iter()
                .map(|c| KeypointDoc { x: c.coords.x, y: c.coords.y })
                .collect();
            (id, keypoints)
        })
        .collect();

    let all_matches = overlaps
        .iter()
        .map(|overlap| OverlapDoc {
            image1: image_id_for_camera(layout, overlap.images[0].as_str(), frame, ext),
            image2: image_id_for_camera(layout, overlap.images[1].as_str(), frame, ext),
            matches: overlap
                .matches
                .iter()
                .map(|m| MatchDoc {
                    idx1: m.corners[0],
                    idx2: m.corners[1],
                    score: Some(m.score),
                })
                .collect(),
        })
        .collect();

    let doc = MatchesDoc { all_matches, images };
    let path = path.as_ref();
    info!("Saving matches to file: {}", path.display());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

/// Load feature positions and overlaps. Images whose camera id is unknown to
/// the rig are skipped. A `match_score_threshold` of 0 keeps every match and
/// tolerates missing scores; otherwise matches below the threshold (or with
/// no recorded score) are dropped.
pub fn load_matches(
    path: impl AsRef<Path>,
    rig_index: &RigIndex,
    layout: RigLayout,
    match_score_threshold: Real,
) -> Result<(FeaturePositions, Vec<Overlap>)> {
    let json = std::fs::read_to_string(path)?;
    parse_matches(&json, rig_index, layout, match_score_threshold)
}

pub fn parse_matches(
    json: &str,
    rig_index: &RigIndex,
    layout: RigLayout,
    match_score_threshold: Real,
) -> Result<(FeaturePositions, Vec<Overlap>)> {
    let doc: MatchesDoc = serde_json::from_str(json)?;

    let known = |image: &ImageId| {
        image
            .camera_id(layout)
            .is_some_and(|id| rig_index.by_id.contains_key(&id))
    };

    let mut positions = FeaturePositions::new();
    for (image, keypoints) in doc.images {
        if !known(&image) {
            info!("ignoring image id {image}");
            continue;
        }
        positions.insert(
            image,
            keypoints.iter().map(|k| Vec2::new(k.x, k.y)).collect(),
        );
    }
    if positions.is_empty() {
        return Err(CalibrationError::Rig(format!(
            "no usable images; verify image id format: {}",
            layout.format()
        )));
    }
    info!("{} images loaded", positions.len());

    let mut overlaps = Vec::new();
    let mut observations = 0;
    for entry in doc.all_matches {
        if !known(&entry.image1) || !known(&entry.image2) {
            continue;
        }
        let mut overlap = Overlap::new(entry.image1, entry.image2);
        for m in entry.matches {
            let keep = match_score_threshold == 0.0
                || m.score.is_some_and(|s| s >= match_score_threshold);
            if keep {
                overlap.matches.push(Match {
                    score: m.score.unwrap_or(Real::NAN),
                    corners: [m.idx1, m.idx2],
                });
            }
        }
        observations += 2 * overlap.matches.len();
        overlaps.push(overlap);
    }
    info!("{observations} feature observations loaded");

    Ok((positions, overlaps))
}

/// Drop overlaps with anomalously few matches relative to the mean;
/// `fraction` of 0 disables.
pub fn remove_sparse_overlaps(overlaps: &mut Vec<Overlap>, fraction: Real) {
    if fraction <= 0.0 || overlaps.is_empty() {
        return;
    }
    let mean =
        overlaps.iter().map(|o| o.matches.len()).sum::<usize>() as Real / overlaps.len() as Real;
    let cutoff = fraction * mean;
    overlaps.retain(|overlap| {
        let keep = overlap.matches.len() as Real >= cutoff;
        if !keep {
            info!(
                "dropping sparse overlap {} {} with {} matches",
                overlap.images[0],
                overlap.images[1],
                overlap.matches.len()
            );
        }
        keep
    });
}
