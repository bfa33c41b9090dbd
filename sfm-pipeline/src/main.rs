use cv_sfm::{run_pipeline, PipelinePaths, PipelineSettings};
use log::*;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "sfm-pipeline",
    about = "Refines a reference reconstruction using features matched across covisible images"
)]
struct Opt {
    /// The directory containing the images of the reconstruction
    #[structopt(short, long, default_value = "data/images")]
    images: PathBuf,
    /// The directory of the reference model in COLMAP text format
    #[structopt(short, long, default_value = "data/input_model")]
    reference: PathBuf,
    /// The directory where features, matches, pairs and the refined model are written
    #[structopt(short, long, default_value = "data/results")]
    outputs: PathBuf,
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_sfm::PipelineSettings`. Missing fields use their defaults.
    #[structopt(short, long)]
    settings: Option<PathBuf>,
    /// The number of most covisible images matched against each image
    #[structopt(long)]
    num_matched: Option<usize>,
    /// Recompute features, matches and the refined model even if they exist
    #[structopt(long)]
    overwrite: bool,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let mut settings: PipelineSettings = match &opt.settings {
        Some(path) => {
            let loaded = std::fs::File::open(path)
                .map_err(|e| e.to_string())
                .and_then(|file| serde_json::from_reader(file).map_err(|e| e.to_string()));
            match loaded {
                Ok(settings) => {
                    info!("loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    error!("unable to load settings from {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("used default settings");
            PipelineSettings::default()
        }
    };
    if let Some(num_matched) = opt.num_matched {
        settings.num_matched = num_matched;
    }
    settings.overwrite |= opt.overwrite;

    let paths = PipelinePaths {
        images: opt.images,
        reference: opt.reference,
        outputs: opt.outputs,
    };
    match run_pipeline(&paths, &settings) {
        Ok((_, stats)) => {
            let refinement = &stats.refinement;
            info!(
                "refined {} of {} tracks ({} missing observations, {} degenerate)",
                refinement.output_tracks,
                refinement.input_tracks,
                refinement.dropped_missing_observation,
                refinement.dropped_degenerate_geometry
            );
            info!(
                "reprojection rmse {:.4} px -> {:.4} px",
                refinement.reference_rmse, refinement.refined_rmse
            );
        }
        Err(e) => {
            error!("pipeline failed: {}", e);
            std::process::exit(1);
        }
    }
}
