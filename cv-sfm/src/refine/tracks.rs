//! Association of reference tracks with detected keypoints and match edges.

use crate::{
    Error, FeatureStore, ImageId, MatchStore, Pair, Reconstruction, Result, Track, TrackElement,
    TrackId,
};
use cv_core::nalgebra::Point2;
use cv_core::WorldPoint;
use log::*;
use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use std::collections::{BTreeSet, HashMap, HashSet};

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// The detected keypoints of one image with a spatial index over them.
pub(crate) struct ImageKeypoints {
    keypoints: Vec<Point2<f64>>,
    tree: RTree<IndexedPoint>,
}

impl ImageKeypoints {
    pub(crate) fn new(keypoints: Vec<Point2<f64>>) -> Self {
        let tree = RTree::bulk_load(
            keypoints
                .iter()
                .enumerate()
                .map(|(ix, p)| IndexedPoint::new([p.x, p.y], ix))
                .collect(),
        );
        Self { keypoints, tree }
    }

    /// The detected keypoint belonging to an observation.
    ///
    /// Feature sets usually keep the observation order of the model, so the keypoint with the same
    /// index is tried first, then the nearest one. Either must lie within `radius`.
    pub(crate) fn associate(&self, location: Point2<f64>, index: usize, radius: f64) -> Option<usize> {
        if let Some(keypoint) = self.keypoints.get(index) {
            if (keypoint - location).norm() <= radius {
                return Some(index);
            }
        }
        self.tree
            .nearest_neighbor(&[location.x, location.y])
            .map(|nearest| nearest.data)
            .filter(|&ix| (self.keypoints[ix] - location).norm() <= radius)
    }

    pub(crate) fn keypoint(&self, index: usize) -> Point2<f64> {
        self.keypoints[index]
    }
}

/// A track being refined.
#[derive(Debug, Clone)]
pub(crate) struct TrackState {
    pub id: TrackId,
    pub elements: Vec<TrackElement>,
    /// The detected keypoints the elements were associated with.
    pub detections: Vec<Point2<f64>>,
    /// Current keypoint of every element.
    pub keypoints: Vec<Point2<f64>>,
    /// Pairs of elements joined by a match.
    pub edges: Vec<(usize, usize)>,
    pub position: WorldPoint,
}

/// Matches of every selected pair, oriented from the smaller image id.
struct PairMatches {
    matches: HashMap<(ImageId, ImageId), HashSet<(usize, usize)>>,
}

impl PairMatches {
    fn load(reference: &Reconstruction, pairs: &[Pair], store: &MatchStore) -> Result<Self> {
        let mut matches = HashMap::new();
        for pair in pairs {
            let a = reference.image(pair.a)?;
            let b = reference.image(pair.b)?;
            match store.get(&a.name, &b.name) {
                Ok(correspondences) => {
                    matches.insert(
                        (pair.a, pair.b),
                        correspondences
                            .matches
                            .iter()
                            .map(|m| (m.0, m.1))
                            .collect(),
                    );
                }
                Err(Error::NotFound(_)) => trace!("no matches between {} and {}", a.name, b.name),
                Err(e) => return Err(e),
            }
        }
        Ok(Self { matches })
    }

    fn contains(&self, a: (ImageId, usize), b: (ImageId, usize)) -> bool {
        let (a, b) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        self.matches
            .get(&(a.0, b.0))
            .map(|matches| matches.contains(&(a.1, b.1)))
            .unwrap_or(false)
    }
}

/// Loads the detected keypoints of every image observing a track.
///
/// Images without features map to `None`.
pub(crate) fn load_keypoints(
    reference: &Reconstruction,
    features: &FeatureStore,
) -> Result<HashMap<ImageId, Option<ImageKeypoints>>> {
    let observing: BTreeSet<ImageId> = reference
        .tracks
        .values()
        .flat_map(|track| track.elements.iter().map(|element| element.image))
        .collect();
    observing
        .into_par_iter()
        .map(|id| -> Result<_> {
            let image = reference.image(id)?;
            match features.get(&image.name) {
                Ok(set) => Ok((
                    id,
                    Some(ImageKeypoints::new(
                        set.keypoints.into_iter().map(|keypoint| keypoint.0).collect(),
                    )),
                )),
                Err(Error::NotFound(_)) => {
                    warn!("no features for image {}", image.name);
                    Ok((id, None))
                }
                Err(e) => Err(e),
            }
        })
        .collect()
}

fn resolve_track(
    reference: &Reconstruction,
    track: &Track,
    keypoints: &HashMap<ImageId, Option<ImageKeypoints>>,
    matches: &PairMatches,
    radius: f64,
) -> Result<TrackState> {
    let images: BTreeSet<ImageId> = track.elements.iter().map(|element| element.image).collect();
    if images.len() < 2 {
        return Err(Error::DegenerateGeometry(format!(
            "track {} is observed in {} images",
            track.id,
            images.len()
        )));
    }

    let mut associated = Vec::with_capacity(track.elements.len());
    let mut detections = Vec::with_capacity(track.elements.len());
    for &element in &track.elements {
        let missing = || {
            Error::MissingObservation(format!(
                "track {} has no keypoint for observation {} of image {}",
                track.id, element.observation, element.image
            ))
        };
        let image = keypoints
            .get(&element.image)
            .and_then(Option::as_ref)
            .ok_or_else(missing)?;
        let location = reference.keypoint(element).map_err(|_| missing())?;
        let index = image
            .associate(location.0, element.observation, radius)
            .ok_or_else(missing)?;
        associated.push((element.image, index));
        detections.push(image.keypoint(index));
    }

    let mut edges = vec![];
    for i in 0..associated.len() {
        for j in i + 1..associated.len() {
            if associated[i].0 != associated[j].0 && matches.contains(associated[i], associated[j]) {
                edges.push((i, j));
            }
        }
    }
    if edges.is_empty() {
        return Err(Error::MissingObservation(format!(
            "no match joins the observations of track {}",
            track.id
        )));
    }

    Ok(TrackState {
        id: track.id,
        elements: track.elements.clone(),
        keypoints: detections.clone(),
        detections,
        edges,
        position: track.position,
    })
}

/// Tracks that could be resolved, and the number dropped for each cause.
pub(crate) struct ResolvedTracks {
    pub tracks: Vec<TrackState>,
    pub missing_observation: usize,
    pub degenerate_geometry: usize,
}

pub(crate) fn resolve_tracks(
    reference: &Reconstruction,
    pairs: &[Pair],
    features: &FeatureStore,
    matches: &MatchStore,
    radius: f64,
) -> Result<ResolvedTracks> {
    let keypoints = load_keypoints(reference, features)?;
    let matches = PairMatches::load(reference, pairs, matches)?;
    let outcomes: Vec<Result<TrackState>> = reference
        .tracks
        .values()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|track| resolve_track(reference, track, &keypoints, &matches, radius))
        .collect();

    let mut resolved = ResolvedTracks {
        tracks: vec![],
        missing_observation: 0,
        degenerate_geometry: 0,
    };
    for outcome in outcomes {
        match outcome {
            Ok(track) => resolved.tracks.push(track),
            Err(Error::MissingObservation(message)) => {
                debug!("{}", message);
                resolved.missing_observation += 1;
            }
            Err(Error::DegenerateGeometry(message)) => {
                debug!("{}", message);
                resolved.degenerate_geometry += 1;
            }
            Err(e) => return Err(e),
        }
    }
    info!(
        "resolved {} tracks, {} missing observations, {} degenerate",
        resolved.tracks.len(),
        resolved.missing_observation,
        resolved.degenerate_geometry
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_prefers_the_same_index() {
        let image = ImageKeypoints::new(vec![
            Point2::new(10.0, 10.0),
            Point2::new(10.5, 10.0),
            Point2::new(50.0, 50.0),
        ]);
        assert_eq!(image.associate(Point2::new(10.4, 10.0), 0, 2.0), Some(0));
        assert_eq!(image.associate(Point2::new(10.4, 10.0), 2, 2.0), Some(1));
        assert_eq!(image.associate(Point2::new(30.0, 30.0), 2, 2.0), None);
    }
}
