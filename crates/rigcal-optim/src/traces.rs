//! Features and traces.
//!
//! A [`Feature`] is a detected corner position plus the index of the trace it
//! currently belongs to. A [`Trace`] is one world point together with the
//! `(image, feature index)` references that observe it. Assembly flood-fills
//! trace membership across the pairwise matches: two matched features always
//! end up in the same trace, merging traces when a match bridges two.

use std::collections::BTreeSet;

use log::info;

use rigcal_core::{CalibrationError, ImageId, Result, Vec2, Vec3};
use rigcal_match::{FeaturePositions, Overlap};

#[derive(Clone, Debug)]
pub struct Feature {
    pub position: Vec2,
    /// Index into the trace arena; `None` while unreferenced.
    pub trace: Option<usize>,
}

/// Features of every image, keyed by image id.
pub type FeatureMap = std::collections::BTreeMap<ImageId, Vec<Feature>>;

/// Wrap loaded corner positions into unreferenced features.
pub fn feature_map_from_positions(positions: &FeaturePositions) -> FeatureMap {
    positions
        .iter()
        .map(|(image, corners)| {
            let features = corners
                .iter()
                .map(|&position| Feature {
                    position,
                    trace: None,
                })
                .collect();
            (image.clone(), features)
        })
        .collect()
}

/// A world point and the image features that observe it.
#[derive(Clone, Debug)]
pub struct Trace {
    pub position: Vec3,
    pub references: Vec<(ImageId, usize)>,
}

impl Trace {
    pub fn new() -> Self {
        Trace {
            position: Vec3::zeros(),
            references: Vec::new(),
        }
    }

    pub fn add(&mut self, image: ImageId, index: usize) {
        self.references.push((image, index));
    }

    /// Drop all references, marking their features unreferenced again.
    pub fn clear(&mut self, feature_map: &mut FeatureMap) {
        for (image, index) in self.references.drain(..) {
            if let Some(features) = feature_map.get_mut(&image) {
                if let Some(feature) = features.get_mut(index) {
                    feature.trace = None;
                }
            }
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Trace::new()
    }
}

fn feature_trace(feature_map: &FeatureMap, image: &ImageId, index: usize) -> Result<Option<usize>> {
    feature_map
        .get(image)
        .and_then(|features| features.get(index))
        .map(|feature| feature.trace)
        .ok_or_else(|| {
            CalibrationError::InvariantViolation(format!(
                "match references missing feature {image}:{index}"
            ))
        })
}

fn set_feature_trace(
    feature_map: &mut FeatureMap,
    image: &ImageId,
    index: usize,
    trace: usize,
) -> Result<()> {
    feature_map
        .get_mut(image)
        .and_then(|features| features.get_mut(index))
        .map(|feature| feature.trace = Some(trace))
        .ok_or_else(|| {
            CalibrationError::InvariantViolation(format!(
                "match references missing feature {image}:{index}"
            ))
        })
}

/// Move all of `from`'s references into `into`, repointing their features.
/// `from` becomes a zombie with an empty reference list.
fn inherit(traces: &mut [Trace], feature_map: &mut FeatureMap, into: usize, from: usize) {
    let references = std::mem::take(&mut traces[from].references);
    for (image, index) in &references {
        if let Some(features) = feature_map.get_mut(image) {
            if let Some(feature) = features.get_mut(*index) {
                feature.trace = Some(into);
            }
        }
    }
    traces[into].references.extend(references);
}

/// Group matched features into traces. All features are first marked
/// unreferenced, so assembly can run repeatedly on the same map. Merged-away
/// traces stay in the arena as zombies with empty reference lists.
pub fn assemble_traces(feature_map: &mut FeatureMap, overlaps: &[Overlap]) -> Result<Vec<Trace>> {
    for features in feature_map.values_mut() {
        for feature in features.iter_mut() {
            feature.trace = None;
        }
    }

    let mut traces: Vec<Trace> = Vec::new();
    let mut nonempty = 0usize;
    for overlap in overlaps {
        for m in &overlap.matches {
            let first = feature_trace(feature_map, &overlap.images[0], m.corners[0])?;
            let second = feature_trace(feature_map, &overlap.images[1], m.corners[1])?;
            match (first, second) {
                (None, None) => {
                    // neither belongs to a trace, start a new one
                    traces.push(Trace::new());
                    nonempty += 1;
                    let t = traces.len() - 1;
                    for i in 0..2 {
                        set_feature_trace(feature_map, &overlap.images[i], m.corners[i], t)?;
                        traces[t].add(overlap.images[i].clone(), m.corners[i]);
                    }
                }
                (None, Some(t)) => {
                    set_feature_trace(feature_map, &overlap.images[0], m.corners[0], t)?;
                    traces[t].add(overlap.images[0].clone(), m.corners[0]);
                }
                (Some(t), None) => {
                    set_feature_trace(feature_map, &overlap.images[1], m.corners[1], t)?;
                    traces[t].add(overlap.images[1].clone(), m.corners[1]);
                }
                (Some(a), Some(b)) if a != b => {
                    // the match bridges two traces, merge them
                    inherit(&mut traces, feature_map, a, b);
                    nonempty -= 1;
                }
                _ => {}
            }
        }
    }

    info!("found {nonempty} nonempty traces");
    Ok(traces)
}

/// Clear traces that reference the same image more than once; a world point
/// cannot appear at two pixels of one image.
pub fn remove_invalid_traces(traces: &mut [Trace], feature_map: &mut FeatureMap) {
    let mut total = 0;
    let mut removed = 0;
    for trace in traces.iter_mut() {
        if !trace.references.is_empty() {
            total += 1;
        }
        let mut unique = BTreeSet::new();
        let duplicated = trace
            .references
            .iter()
            .any(|(image, _)| !unique.insert(image.clone()));
        if duplicated {
            trace.clear(feature_map);
            removed += 1;
        }
    }
    info!("removed {removed} out of {total} traces");
}

/// The overlap holding matches between two images, appended if absent. Image
/// order is significant; a reversed duplicate indicates inconsistent input.
pub fn find_or_add_overlap<'a>(
    overlaps: &'a mut Vec<Overlap>,
    image0: &ImageId,
    image1: &ImageId,
) -> &'a mut Overlap {
    debug_assert!(
        overlaps
            .iter()
            .all(|o| !(o.images[0] == *image1 && o.images[1] == *image0)),
        "overlap {image1} {image0} already present in reversed order"
    );
    let found = overlaps
        .iter()
        .position(|o| o.images[0] == *image0 && o.images[1] == *image1);
    let index = match found {
        Some(index) => index,
        None => {
            overlaps.push(Overlap::new(image0.clone(), image1.clone()));
            overlaps.len() - 1
        }
    };
    &mut overlaps[index]
}
