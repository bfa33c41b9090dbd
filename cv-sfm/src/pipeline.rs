//! The whole pipeline: features, covisible pairs, matches and refinement, with every intermediate
//! result stored under one output directory.

use crate::{
    extract_features, list_images, match_pairs, select_covisible_pairs, write_pairs, Error,
    FastPatchExtractor, FeatureStore, MatchStore, MatchingStats, NearestNeighborMatcher,
    PipelineSettings, Reconstruction, ReconstructionStore, RefinementStats, Refiner, Result,
};
use log::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

/// Where the pipeline reads its inputs and writes its outputs.
#[derive(Debug, Clone)]
pub struct PipelinePaths {
    pub images: PathBuf,
    /// The reference model in COLMAP text format.
    pub reference: PathBuf,
    pub outputs: PathBuf,
}

impl PipelinePaths {
    pub fn pairs(&self) -> PathBuf {
        self.outputs.join("pairs-sfm.txt")
    }

    pub fn features(&self) -> PathBuf {
        self.outputs.join("features.bin")
    }

    pub fn matches(&self) -> PathBuf {
        self.outputs.join("matches.bin")
    }

    pub fn sfm(&self) -> PathBuf {
        self.outputs.join("sfm")
    }

    pub fn stats(&self) -> PathBuf {
        self.sfm().join("stats.json")
    }

    pub fn dense(&self) -> PathBuf {
        self.outputs.join("dense")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub num_images: usize,
    pub num_extracted: usize,
    pub num_pairs: usize,
    pub matching: MatchingStats,
    pub refinement: RefinementStats,
}

/// Runs every stage and writes the refined model and its stats.
///
/// Images and pairs already in the stores, and a refined model already written, are not computed
/// again unless `overwrite` is set.
pub fn run_pipeline(
    paths: &PipelinePaths,
    settings: &PipelineSettings,
) -> Result<(Reconstruction, PipelineStats)> {
    settings.validate()?;
    let mut refiner_settings = settings.refiner.clone();
    if refiner_settings.cache_dir.is_none() {
        refiner_settings.cache_dir = Some(paths.dense());
    }
    let refiner = Refiner::new(refiner_settings)?;
    fs::create_dir_all(&paths.outputs).map_err(|e| Error::io(&paths.outputs, e))?;
    let mut stats = PipelineStats::default();

    let reference = ReconstructionStore::new(&paths.reference).read()?;
    let names = list_images(&paths.images)?;
    stats.num_images = names.len();
    info!("found {} images in {}", names.len(), paths.images.display());
    // Reference observations lead the features of their image so that refinement can find them.
    let features = FeatureStore::open(paths.features())?;
    stats.num_extracted = extract_features(
        &FastPatchExtractor::from_settings(settings.extractor),
        &paths.images,
        &names,
        &reference.observed_keypoints(),
        &features,
        settings.overwrite,
    )?;
    features.flush()?;

    let pairs = select_covisible_pairs(&reference, settings.num_matched)?;
    stats.num_pairs = pairs.len();
    if settings.overwrite || !paths.pairs().is_file() {
        write_pairs(paths.pairs(), &pairs, &reference)?;
    } else {
        debug!("keeping existing pairs file {}", paths.pairs().display());
    }
    let named_pairs = pairs
        .iter()
        .map(|pair| -> Result<_> {
            Ok((
                reference.image(pair.a)?.name.clone(),
                reference.image(pair.b)?.name.clone(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let matches = MatchStore::open(paths.matches())?;
    let matcher = NearestNeighborMatcher::from_settings(settings.matcher)?;
    stats.matching = match_pairs(&matcher, &named_pairs, &features, &matches, settings.overwrite)?;
    matches.flush()?;

    let output = ReconstructionStore::new(paths.sfm());
    let stats_path = paths.stats();
    if !settings.overwrite && output.exists() && stats_path.is_file() {
        info!("refined model already present in {}", output.dir().display());
        let file = File::open(&stats_path).map_err(|e| Error::io(&stats_path, e))?;
        let previous: PipelineStats = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::io(&stats_path, e.into()))?;
        stats.refinement = previous.refinement;
        return Ok((output.read()?, stats));
    }
    let (refined, refinement) =
        refiner.triangulate(&reference, &paths.images, &pairs, &features, &matches)?;
    output.write(&refined)?;
    stats.refinement = refinement;

    let file = File::create(&stats_path).map_err(|e| Error::io(&stats_path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &stats)
        .map_err(|e| Error::io(&stats_path, e.into()))?;
    info!("wrote refined model to {}", output.dir().display());
    Ok((refined, stats))
}
