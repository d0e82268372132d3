use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rigcal_core::{load_rig, save_rig, CalibrationConfig, ImageId, RigIndex, RigLayout};
use rigcal_match::{find_all_corners, find_all_matches, save_matches, validate_feature_counts};
use rigcal_pipeline::{geometric_calibration, CalibrationData, PointsFiles};

/// Targetless geometric calibration of multi-camera rigs.
#[derive(Debug, Parser)]
#[command(author, version, about = "Targetless multi-camera rig calibration")]
struct Cli {
    /// Optional JSON calibration config. Defaults are used if omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Detect and match corners in one frame, writing a matches document.
    MatchCorners {
        /// Rig JSON describing the cameras.
        #[arg(long)]
        rig: PathBuf,
        /// Root directory of the color images.
        #[arg(long)]
        color: PathBuf,
        /// Frame index, kept verbatim in image paths.
        #[arg(long, default_value = "000000")]
        frame: String,
        /// Image extension, including the leading dot.
        #[arg(long, default_value = ".png")]
        ext: String,
        /// Output matches JSON.
        #[arg(long)]
        output: PathBuf,
    },
    /// Calibrate a rig from a matches document, or from synthetic
    /// observations when no matches file is given.
    Calibrate {
        /// Input rig JSON; for experiments this is the ground truth.
        #[arg(long)]
        rig_in: PathBuf,
        /// Calibrated rig JSON to write.
        #[arg(long)]
        rig_out: PathBuf,
        /// Matches document from `match-corners`.
        #[arg(long)]
        matches: Option<PathBuf>,
        /// Write the final traces as a plain point cloud.
        #[arg(long)]
        points_file: Option<PathBuf>,
        /// Write the final traces with their observations as JSON.
        #[arg(long)]
        points_file_json: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CalibrationConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CalibrationConfig::default(),
    };
    match &cli.command {
        Command::MatchCorners {
            rig,
            color,
            frame,
            ext,
            output,
        } => match_corners(&config, rig, color, frame, ext, output),
        Command::Calibrate {
            rig_in,
            rig_out,
            matches,
            points_file,
            points_file_json,
        } => {
            let points_files = PointsFiles {
                text: points_file.clone(),
                json: points_file_json.clone(),
            };
            calibrate(&config, rig_in, rig_out, matches.as_deref(), &points_files)
        }
    }
}

fn image_path(
    color: &Path,
    layout: RigLayout,
    camera_id: &str,
    frame: &str,
    ext: &str,
) -> PathBuf {
    let id = ImageId::from_parts(layout, camera_id, frame);
    color.join(format!("{id}{ext}"))
}

fn match_corners(
    config: &CalibrationConfig,
    rig_path: &Path,
    color: &Path,
    frame: &str,
    ext: &str,
    output: &Path,
) -> Result<()> {
    let rig =
        load_rig(rig_path).with_context(|| format!("loading rig {}", rig_path.display()))?;
    if rig.is_empty() {
        bail!("rig {} has no cameras", rig_path.display());
    }

    let mut images = Vec::with_capacity(rig.len());
    for camera in &rig {
        let path = image_path(color, config.layout, &camera.id, frame, ext);
        let image = image::open(&path)
            .with_context(|| format!("opening {}", path.display()))?
            .to_luma8();
        images.push(image);
    }

    let corners = find_all_corners(&rig, &images, config)?;
    validate_feature_counts(&corners, config.detector.min_features)?;
    let overlaps = find_all_matches(&rig, &images, &corners, config)?;
    save_matches(output, &corners, &overlaps, config.layout, frame, ext)?;
    Ok(())
}

fn calibrate(
    config: &CalibrationConfig,
    rig_in: &Path,
    rig_out: &Path,
    matches: Option<&Path>,
    points_files: &PointsFiles,
) -> Result<()> {
    let ground_truth =
        load_rig(rig_in).with_context(|| format!("loading rig {}", rig_in.display()))?;
    if ground_truth.is_empty() {
        bail!("rig {} has no cameras", rig_in.display());
    }
    let rig_index = RigIndex::new(&ground_truth);

    let data = match matches {
        Some(path) => CalibrationData::load(path, &rig_index, config.layout, &config.matcher)
            .with_context(|| format!("loading matches {}", path.display()))?,
        None => {
            info!("no matches file given, generating artificial points");
            let mut rng = match config.experiment.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            CalibrationData::synthetic(&ground_truth, config, &mut rng)
        }
    };

    let (cameras, median) = geometric_calibration(&ground_truth, &data, config, points_files)?;
    let comments = vec![format!("median reprojection error {median}")];
    save_rig(rig_out, &cameras, &comments)?;
    info!("saved rig to {}", rig_out.display());
    Ok(())
}
