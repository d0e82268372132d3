//! Error statistics, accuracy reports and point cloud export.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use log::info;
use serde::Serialize;

use rigcal_core::{percentile, Camera, Real, Result, SolveConfig};
use rigcal_optim::{FeatureMap, Trace};

/// Huber's robust cost of an error value, matching the loss applied to the
/// solver residuals.
fn huber(value: Real, scale: Real) -> Real {
    let threshold = scale * scale;
    if value <= threshold {
        value
    } else {
        2.0 * scale * value.sqrt() - threshold
    }
}

/// Error norms as the statistics should see them: passed through the Huber
/// cost when `weighted_statistics` is on, verbatim otherwise.
pub fn weighted_norms(norms: &[Real], config: &SolveConfig) -> Vec<Real> {
    if config.weighted_statistics && config.robust {
        norms
            .iter()
            .map(|&n| huber(n, config.robust_scale))
            .collect()
    } else {
        norms.to_vec()
    }
}

/// One-line summary of reprojection error norms: count, RMSE, average,
/// median, upper percentiles and the worst three. With `weighted_statistics`
/// the norms pass through the Huber cost first, so the summary reflects what
/// the solver actually minimized.
pub fn reprojection_report(norms: &[Real], config: &SolveConfig) -> String {
    if norms.is_empty() {
        return "reprojections 0".to_string();
    }
    let mut norms = weighted_norms(norms, config);

    let total: Real = norms.iter().sum();
    let total_sq: Real = norms.iter().map(|n| n * n).sum();
    let count = norms.len();

    let mut result = format!(
        "reprojections {count} RMSE {} average {} median {} 90% {} 99% {} worst 3:",
        (total_sq / count as Real).sqrt(),
        total / count as Real,
        percentile(&norms, 0.5),
        percentile(&norms, 0.9),
        percentile(&norms, 0.99),
    );
    norms.sort_by(Real::total_cmp);
    for norm in norms.iter().rev().take(3).rev() {
        let _ = write!(result, " {norm}");
    }
    result
}

fn acos_clamp(x: Real) -> Real {
    x.clamp(-1.0, 1.0).acos()
}

/// RMSE of every camera parameter family against a ground-truth rig, plus
/// the RMSE of pairwise optical-axis angles. Pairs whose true angle exceeds
/// one radian are skipped; wide angles say little about calibration quality.
pub fn camera_rmse_report(cameras: &[Camera], ground_truth: &[Camera]) -> String {
    let mut position = 0.0;
    let mut rotation = 0.0;
    let mut principal = 0.0;
    let mut distortion = 0.0;
    let mut focal = 0.0;

    for (camera, truth) in cameras.iter().zip(ground_truth) {
        position += (camera.position - truth.position).norm_squared();
        for v in 0..3 {
            rotation += (camera.rotation.row(v) - truth.rotation.row(v)).norm_squared();
        }
        principal += (camera.principal - truth.principal).norm_squared();
        distortion += (camera.distortion() - truth.distortion()).norm_squared();
        focal += (camera.focal - truth.focal).norm_squared();
    }

    let mut angle = 0.0;
    let mut angle_count = 0usize;
    for i in 0..cameras.len() {
        for j in 0..i {
            let axis = |c: &Camera| c.rotation.row(2).transpose();
            let before = acos_clamp(axis(&ground_truth[i]).dot(&axis(&ground_truth[j])));
            if before > 1.0 {
                continue;
            }
            let after = acos_clamp(axis(&cameras[i]).dot(&axis(&cameras[j])));
            angle += (after - before) * (after - before);
            angle_count += 1;
        }
    }

    let n = cameras.len() as Real;
    format!(
        "RMSEs: Pos {} Rot {} Principal {} Distortion {} Focal {} Angle {}",
        (position / n).sqrt(),
        (rotation / (3.0 * n)).sqrt(),
        (principal / n).sqrt(),
        (distortion / n).sqrt(),
        (focal / n).sqrt(),
        if angle_count > 0 {
            (angle / angle_count as Real).sqrt()
        } else {
            0.0
        },
    )
}

/// Log each camera's reprojection error percentiles. `errors` holds squared
/// norms, as produced by [`crate::reproj::reprojection_errors`].
pub fn log_per_camera_errors(cameras: &[Camera], errors: &[Vec<Real>]) {
    for (camera, errors) in cameras.iter().zip(errors) {
        let mut line = String::new();
        for p in [0.5, 0.9, 0.99] {
            let _ = write!(
                line,
                "{}%: {:.2} ",
                (p * 100.0) as u32,
                percentile(errors, p).sqrt()
            );
        }
        info!("{}: {} reproj. percentile {line}", camera.id, errors.len());
    }
}

/// Write nonempty traces as a plain point cloud, one `x y z 1 0 0 0` line
/// per point (position, a delimiter, a black RGB value).
pub fn save_points_file(path: impl AsRef<Path>, traces: &[Trace]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for trace in traces.iter().filter(|t| !t.references.is_empty()) {
        writeln!(
            file,
            "{} {} {} 1 0 0 0",
            trace.position.x, trace.position.y, trace.position.z
        )?;
    }
    file.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct FeatureDoc {
    y: Real,
    x: Real,
    image_id: String,
}

#[derive(Serialize)]
struct TraceDoc {
    features: Vec<FeatureDoc>,
    #[serde(rename = "number of references")]
    reference_count: usize,
    z: Real,
    y: Real,
    x: Real,
}

#[derive(Serialize)]
struct PointsDoc {
    points: Vec<TraceDoc>,
}

/// Write nonempty traces as JSON, each with its observing features.
pub fn save_points_file_json(
    path: impl AsRef<Path>,
    feature_map: &FeatureMap,
    traces: &[Trace],
) -> Result<()> {
    let points = traces
        .iter()
        .filter(|t| !t.references.is_empty())
        .map(|trace| {
            let features = trace
                .references
                .iter()
                .filter_map(|(image, index)| {
                    let feature = feature_map.get(image)?.get(*index)?;
                    Some(FeatureDoc {
                        y: feature.position.y,
                        x: feature.position.x,
                        image_id: image.to_string(),
                    })
                })
                .collect();
            TraceDoc {
                features,
                reference_count: trace.references.len(),
                z: trace.position.z,
                y: trace.position.y,
                x: trace.position.x,
            }
        })
        .collect();
    let doc = PointsDoc { points };
    std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rigcal_core::{ImageId, Projection, Vec2, Vec3};
    use rigcal_optim::Feature;

    #[test]
    fn report_orders_the_statistics() {
        let norms = vec![1.0, 2.0, 3.0, 4.0, 100.0];
        let report = reprojection_report(&norms, &SolveConfig::default());
        assert!(report.starts_with("reprojections 5 RMSE"));
        assert!(report.contains("median 3"));
        assert!(report.ends_with("worst 3: 3 4 100"));
    }

    #[test]
    fn weighted_report_caps_the_outlier() {
        let norms = vec![1.0, 100.0];
        let config = SolveConfig {
            weighted_statistics: true,
            robust_scale: 1.0,
            ..SolveConfig::default()
        };
        let report = reprojection_report(&norms, &config);
        // huber turns 100 into 2 * sqrt(100) - 1 = 19
        assert!(report.contains("worst 3: 1 19"));
    }

    #[test]
    fn identical_rigs_have_zero_rmse() {
        let mut camera = Camera::new(
            Projection::Rectilinear,
            Vec2::new(640.0, 480.0),
            Vec2::new(500.0, -500.0),
        );
        camera.position = Vec3::new(0.1, 0.2, 0.3);
        let rig = vec![camera.clone(), camera];
        let report = camera_rmse_report(&rig, &rig);
        assert_eq!(report, "RMSEs: Pos 0 Rot 0 Principal 0 Distortion 0 Focal 0 Angle 0");
    }

    #[test]
    fn points_files_skip_zombie_traces() {
        let mut live = Trace::new();
        live.position = Vec3::new(1.0, 2.0, 3.0);
        live.add(ImageId::from("cam0/0"), 0);
        let zombie = Trace::new();
        let traces = vec![live, zombie];

        let mut feature_map = FeatureMap::new();
        feature_map.insert(
            ImageId::from("cam0/0"),
            vec![Feature {
                position: Vec2::new(10.0, 20.0),
                trace: Some(0),
            }],
        );

        let dir = tempfile::tempdir().unwrap();
        let text_path = dir.path().join("points.txt");
        save_points_file(&text_path, &traces).unwrap();
        let text = std::fs::read_to_string(&text_path).unwrap();
        assert_eq!(text, "1 2 3 1 0 0 0\n");

        let json_path = dir.path().join("points.json");
        save_points_file_json(&json_path, &feature_map, &traces).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        let points = parsed["points"].as_array().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0]["number of references"], 1);
        assert_relative_eq!(points[0]["features"][0]["x"].as_f64().unwrap(), 10.0);
    }
}
