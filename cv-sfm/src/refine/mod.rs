//! Refinement of a reference reconstruction.
//!
//! The keypoints of every track are first moved so that dense features sampled around them agree
//! across images. The tracks are then triangulated again from the adjusted keypoints and bundle
//! adjusted together with the poses. The reference model is never modified; the result is a new
//! model with the same cameras and images, the surviving tracks, and the adjusted observations.

mod geometry;
mod keypoints;
mod stats;
mod tracks;

pub use stats::*;

use crate::{
    DenseExtractor, DenseFeatureCache, Error, FeatureStore, GradientDenseExtractor, MatchStore,
    Pair, Reconstruction, RefinerSettings, Result, TrackId,
};
use cv_core::KeyPoint;
use cv_optimize::KeypointAdjuster;
use geometry::Views;
use log::*;
use std::collections::BTreeMap;
use std::path::Path;

pub struct Refiner<E = GradientDenseExtractor> {
    settings: RefinerSettings,
    extractor: E,
}

impl Refiner {
    /// Validates the settings and uses the dense extractor they name.
    pub fn new(settings: RefinerSettings) -> Result<Self> {
        let extractor = GradientDenseExtractor::from_settings(settings.dense);
        Self::with_extractor(settings, extractor)
    }
}

impl<E> Refiner<E>
where
    E: DenseExtractor + Sync,
{
    pub fn with_extractor(settings: RefinerSettings, extractor: E) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            extractor,
        })
    }

    pub fn settings(&self) -> &RefinerSettings {
        &self.settings
    }

    fn keypoint_adjuster(&self) -> KeypointAdjuster {
        KeypointAdjuster::new()
            .patch_size(self.settings.patch_size)
            .loss(self.settings.keypoint_loss)
            .max_iterations(self.settings.max_iterations)
            .tolerance(self.settings.tolerance)
            .max_displacement(self.settings.max_displacement)
    }

    fn dense_cache(&self) -> Result<DenseFeatureCache> {
        Ok(if self.settings.low_memory {
            let dir = self.settings.cache_dir.clone().ok_or_else(|| {
                Error::Config("low_memory requires a cache_dir".into())
            })?;
            DenseFeatureCache::on_disk(dir)
        } else {
            DenseFeatureCache::in_memory(self.settings.cache_dir.clone())
        })
    }

    /// Refines the reference model against the features and matches of the selected pairs.
    ///
    /// Tracks that cannot be associated with matched keypoints or that no longer triangulate are
    /// dropped and counted in the returned stats.
    pub fn triangulate(
        &self,
        reference: &Reconstruction,
        images_dir: impl AsRef<Path>,
        pairs: &[Pair],
        features: &FeatureStore,
        matches: &MatchStore,
    ) -> Result<(Reconstruction, RefinementStats)> {
        if reference.tracks.is_empty() {
            return Err(Error::InsufficientData(
                "the reference model has no tracks".into(),
            ));
        }
        let settings = &self.settings;
        let mut stats = RefinementStats {
            input_tracks: reference.tracks.len(),
            reference_rmse: reference.reprojection_rmse()?,
            ..RefinementStats::default()
        };
        info!(
            "refining {} tracks of {} images over {} pairs",
            reference.tracks.len(),
            reference.images.len(),
            pairs.len()
        );

        let resolved =
            tracks::resolve_tracks(reference, pairs, features, matches, settings.association_radius)?;
        stats.dropped_missing_observation = resolved.missing_observation;
        stats.dropped_degenerate_geometry = resolved.degenerate_geometry;
        let mut tracks = resolved.tracks;

        let mut views = Views {
            poses: BTreeMap::new(),
            cameras: BTreeMap::new(),
        };
        for image in reference.images.values() {
            views.poses.insert(image.id, image.pose);
            views
                .cameras
                .insert(image.id, reference.camera(image.camera)?.model()?);
        }

        let mut cache = self.dense_cache()?;
        let names: Vec<String> = tracks
            .iter()
            .flat_map(|track| track.elements.iter().map(|element| element.image))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|id| reference.image(id).map(|image| image.name.clone()))
            .collect::<Result<_>>()?;
        cache.prepare(
            &self.extractor,
            images_dir.as_ref(),
            &names,
            settings.dtype,
            settings.use_cache,
        )?;

        let adjuster = self.keypoint_adjuster();
        for pass in 0..settings.alternations {
            if pass > 0 {
                geometry::reseed_keypoints(&views, &mut tracks, settings.max_displacement);
            }
            let keypoint_adjustment = keypoints::adjust_keypoints(
                &adjuster,
                reference,
                &cache,
                &mut tracks,
                settings.batch_size,
            )?;
            let (surviving, degenerate) = geometry::triangulate_tracks(&views, tracks, settings)?;
            tracks = surviving;
            stats.dropped_degenerate_geometry += degenerate;
            let bundle_adjustment = if tracks.is_empty() {
                warn!("no track left to bundle adjust");
                BundleAdjustmentStats::default()
            } else {
                geometry::bundle_adjust(&mut views, &mut tracks, settings)?
            };
            stats.passes.push(RefinementPass {
                keypoint_adjustment,
                bundle_adjustment,
            });
        }

        let mut refined = reference.clone();
        for image in refined.images.values_mut() {
            if let Some(&pose) = views.poses.get(&image.id) {
                image.pose = pose;
            }
        }
        let surviving: BTreeMap<TrackId, _> =
            tracks.into_iter().map(|track| (track.id, track)).collect();
        let dropped: Vec<TrackId> = refined
            .tracks
            .keys()
            .filter(|id| !surviving.contains_key(id))
            .copied()
            .collect();
        for id in dropped {
            refined.remove_track(id);
        }
        for (id, track) in &surviving {
            if let Some(refined_track) = refined.tracks.get_mut(id) {
                refined_track.position = track.position;
            }
            for (element, keypoint) in track.elements.iter().zip(&track.keypoints) {
                if let Some(observation) = refined
                    .images
                    .get_mut(&element.image)
                    .and_then(|image| image.observations.get_mut(element.observation))
                {
                    observation.keypoint = KeyPoint(*keypoint);
                }
            }
        }
        refined.update_track_errors()?;

        stats.output_tracks = refined.tracks.len();
        stats.refined_rmse = refined.reprojection_rmse()?;
        info!(
            "refined {} of {} tracks, reprojection rmse {:.4} -> {:.4} px",
            stats.output_tracks, stats.input_tracks, stats.reference_rmse, stats.refined_rmse
        );
        Ok((refined, stats))
    }
}
