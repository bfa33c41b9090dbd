//! The featuremetric keypoint adjustment stage.

use super::tracks::TrackState;
use super::KeypointAdjustmentStats;
use crate::{DenseFeatureCache, FeatureMap, ImageId, Reconstruction, Result};
use cv_optimize::{KeypointAdjuster, KeypointAdjustmentReport};
use itertools::Itertools;
use log::*;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Adjusts the keypoints of every track in place, loading the dense maps of `batch_size` tracks at
/// a time.
pub(crate) fn adjust_keypoints(
    adjuster: &KeypointAdjuster,
    reference: &Reconstruction,
    cache: &DenseFeatureCache,
    tracks: &mut [TrackState],
    batch_size: usize,
) -> Result<KeypointAdjustmentStats> {
    let mut stats = KeypointAdjustmentStats::default();
    let num_batches = (tracks.len() + batch_size - 1) / batch_size;
    for (batch_ix, batch) in tracks.chunks_mut(batch_size).enumerate() {
        let ids: Vec<ImageId> = batch
            .iter()
            .flat_map(|track| track.elements.iter().map(|element| element.image))
            .unique()
            .collect();
        let names = ids
            .iter()
            .map(|&id| reference.image(id).map(|image| image.name.clone()))
            .collect::<Result<Vec<_>>>()?;
        let mut loaded = cache.load(&names)?;
        let maps: HashMap<ImageId, Arc<FeatureMap>> = ids
            .iter()
            .zip(&names)
            .filter_map(|(&id, name)| Some((id, loaded.remove(name)?)))
            .collect();
        debug!(
            "keypoint adjustment batch {}/{} with {} tracks over {} images",
            batch_ix + 1,
            num_batches,
            batch.len(),
            maps.len()
        );

        let reports: Vec<Option<KeypointAdjustmentReport>> = batch
            .par_iter_mut()
            .map(|track| -> Option<KeypointAdjustmentReport> {
                let track_maps = track
                    .elements
                    .iter()
                    .map(|element| maps.get(&element.image).map(|map| &**map))
                    .collect::<Option<Vec<&FeatureMap>>>()?;
                let report = adjuster.adjust(&track_maps, &track.keypoints, &track.edges);
                trace!(
                    "track {}: cost {} -> {} in {} evaluations{}",
                    track.id,
                    report.initial_cost,
                    report.final_cost,
                    report.iterations,
                    if report.reverted { " (reverted)" } else { "" }
                );
                track.keypoints = report.keypoints.clone();
                Some(report)
            })
            .collect();
        for report in reports.iter().flatten() {
            stats.add(report);
        }
    }
    info!(
        "adjusted keypoints of {} tracks: cost {} -> {}, {} converged, {} reverted",
        stats.tracks, stats.initial_cost, stats.final_cost, stats.converged, stats.reverted
    );
    Ok(stats)
}
