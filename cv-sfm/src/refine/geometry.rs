//! Re-triangulation of adjusted tracks and bundle adjustment.

use super::tracks::TrackState;
use super::BundleAdjustmentStats;
use crate::{Error, ImageId, RefinerSettings, Result};
use cv_core::{CameraModel, KeyPoint, TriangulatorObservations, WorldToCamera};
use cv_geom::{max_ray_angle, LinearEigenTriangulator};
use cv_optimize::{BundleAdjuster, BundleObservation, BundleProblem};
use cv_pinhole::PinholeCamera;
use log::*;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// The posed cameras of the model being refined.
pub(crate) struct Views {
    pub poses: BTreeMap<ImageId, WorldToCamera>,
    pub cameras: BTreeMap<ImageId, PinholeCamera>,
}

impl Views {
    fn view(&self, image: ImageId) -> Result<(WorldToCamera, PinholeCamera)> {
        match (self.poses.get(&image), self.cameras.get(&image)) {
            (Some(&pose), Some(&camera)) => Ok((pose, camera)),
            _ => Err(Error::NotFound(format!("image {}", image))),
        }
    }
}

fn triangulate_track(
    triangulator: &LinearEigenTriangulator,
    views: &Views,
    track: &mut TrackState,
    min_angle: f64,
) -> Result<()> {
    let observations = track
        .elements
        .iter()
        .zip(&track.keypoints)
        .map(|(element, &keypoint)| -> Result<_> {
            let (pose, camera) = views.view(element.image)?;
            Ok((pose, camera.calibrate(KeyPoint(keypoint))))
        })
        .collect::<Result<Vec<_>>>()?;

    let angle = max_ray_angle(&observations);
    if angle < min_angle {
        return Err(Error::DegenerateGeometry(format!(
            "track {} has a triangulation angle of {:.3} degrees",
            track.id,
            angle.to_degrees()
        )));
    }
    track.position = triangulator
        .triangulate_observations(observations)
        .ok_or_else(|| {
            Error::DegenerateGeometry(format!(
                "track {} cannot be triangulated in front of its cameras",
                track.id
            ))
        })?;
    Ok(())
}

/// Triangulates every track from its current keypoints, returning the surviving tracks and the
/// number of degenerate ones.
pub(crate) fn triangulate_tracks(
    views: &Views,
    tracks: Vec<TrackState>,
    settings: &RefinerSettings,
) -> Result<(Vec<TrackState>, usize)> {
    let triangulator = LinearEigenTriangulator::new();
    let min_angle = settings.min_triangulation_angle_deg.to_radians();
    let outcomes: Vec<(TrackState, Result<()>)> = tracks
        .into_par_iter()
        .map(|mut track| {
            let outcome = triangulate_track(&triangulator, views, &mut track, min_angle);
            (track, outcome)
        })
        .collect();

    let mut surviving = Vec::with_capacity(outcomes.len());
    let mut degenerate = 0;
    for (track, outcome) in outcomes {
        match outcome {
            Ok(()) => surviving.push(track),
            Err(Error::DegenerateGeometry(message)) => {
                debug!("{}", message);
                degenerate += 1;
            }
            Err(e) => return Err(e),
        }
    }
    info!(
        "triangulated {} tracks, {} degenerate",
        surviving.len(),
        degenerate
    );
    Ok((surviving, degenerate))
}

/// Refines track positions and the free poses against the current keypoints.
///
/// A pose is held fixed when poses are not refined, when its image is listed in `fixed_images`,
/// or when it is one of the `num_fixed_images` lowest image ids taking part.
pub(crate) fn bundle_adjust(
    views: &mut Views,
    tracks: &mut [TrackState],
    settings: &RefinerSettings,
) -> Result<BundleAdjustmentStats> {
    let images: Vec<ImageId> = tracks
        .iter()
        .flat_map(|track| track.elements.iter().map(|element| element.image))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let index: BTreeMap<ImageId, usize> =
        images.iter().enumerate().map(|(ix, &id)| (id, ix)).collect();

    let mut problem = BundleProblem {
        cameras: Vec::with_capacity(images.len()),
        poses: Vec::with_capacity(images.len()),
        fixed: Vec::with_capacity(images.len()),
        points: tracks.iter().map(|track| track.position).collect(),
        observations: vec![],
    };
    for (ix, &image) in images.iter().enumerate() {
        let (pose, camera) = views.view(image)?;
        problem.cameras.push(camera);
        problem.poses.push(pose);
        problem.fixed.push(
            !settings.refine_poses
                || settings.fixed_images.contains(&image)
                || ix < settings.num_fixed_images,
        );
    }
    for (point, track) in tracks.iter().enumerate() {
        for (element, &keypoint) in track.elements.iter().zip(&track.keypoints) {
            problem.observations.push(BundleObservation {
                image: index[&element.image],
                point,
                keypoint,
            });
        }
    }

    let free_poses = problem.fixed.iter().filter(|&&fixed| !fixed).count();
    let report = BundleAdjuster::new()
        .loss(settings.bundle_loss)
        .max_iterations(settings.max_iterations)
        .tolerance(settings.tolerance)
        .optimize(&mut problem);
    info!(
        "bundle adjustment of {} tracks and {} free poses: cost {} -> {} in {} iterations",
        tracks.len(),
        free_poses,
        report.initial_cost,
        report.final_cost,
        report.iterations
    );

    for (&image, &pose) in images.iter().zip(&problem.poses) {
        views.poses.insert(image, pose);
    }
    for (track, &position) in tracks.iter_mut().zip(&problem.points) {
        track.position = position;
    }

    Ok(BundleAdjustmentStats {
        tracks: tracks.len(),
        free_poses,
        initial_cost: report.initial_cost,
        final_cost: report.final_cost,
        iterations: report.iterations,
        converged: report.converged,
    })
}

/// Moves each keypoint to the projection of its track when it lies within `max_displacement` of
/// the detection.
pub(crate) fn reseed_keypoints(views: &Views, tracks: &mut [TrackState], max_displacement: f64) {
    let mut moved = 0usize;
    for track in tracks.iter_mut() {
        for ix in 0..track.elements.len() {
            let image = track.elements[ix].image;
            let projection = views.view(image).ok().and_then(|(pose, camera)| {
                camera.project(pose.transform(track.position))
            });
            if let Some(projection) = projection {
                if (projection.0 - track.detections[ix]).norm() <= max_displacement {
                    track.keypoints[ix] = projection.0;
                    moved += 1;
                }
            }
        }
    }
    debug!("re-seeded {} keypoints at their projections", moved);
}
