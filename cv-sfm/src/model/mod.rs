//! The in-memory sparse reconstruction: cameras, posed images with their 2d observations, and
//! tracks of 3d points observed in two or more images.

mod colmap;

pub use colmap::*;

use crate::{Error, Result};
use cv_core::nalgebra::{Point2, Vector2};
use cv_core::{CameraModel, KeyPoint, WorldPoint, WorldToCamera};
use cv_pinhole::{CameraIntrinsics, PinholeCamera, RadialDistortion};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug,
            Copy,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Display,
            From,
            Into,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);
    };
}

id_type!(CameraId);
id_type!(ImageId);
id_type!(TrackId);

/// The intrinsics parameterizations understood by the reconstruction files.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraKind {
    /// `f, cx, cy`
    SimplePinhole,
    /// `fx, fy, cx, cy`
    Pinhole,
    /// `f, cx, cy, k`
    SimpleRadial,
    /// `f, cx, cy, k1, k2`
    Radial,
}

impl CameraKind {
    pub fn name(self) -> &'static str {
        match self {
            CameraKind::SimplePinhole => "SIMPLE_PINHOLE",
            CameraKind::Pinhole => "PINHOLE",
            CameraKind::SimpleRadial => "SIMPLE_RADIAL",
            CameraKind::Radial => "RADIAL",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "SIMPLE_PINHOLE" => CameraKind::SimplePinhole,
            "PINHOLE" => CameraKind::Pinhole,
            "SIMPLE_RADIAL" => CameraKind::SimpleRadial,
            "RADIAL" => CameraKind::Radial,
            _ => return None,
        })
    }

    pub fn num_params(self) -> usize {
        match self {
            CameraKind::SimplePinhole => 3,
            CameraKind::Pinhole => 4,
            CameraKind::SimpleRadial => 4,
            CameraKind::Radial => 5,
        }
    }
}

/// A camera, shared by every image taken with it. Intrinsics are never refined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: CameraId,
    pub kind: CameraKind,
    pub width: u32,
    pub height: u32,
    pub params: Vec<f64>,
}

impl Camera {
    /// Builds the camera model from the parameter list.
    pub fn model(&self) -> Result<PinholeCamera> {
        if self.params.len() != self.kind.num_params() {
            return Err(Error::Config(format!(
                "camera {} of kind {} has {} parameters instead of {}",
                self.id,
                self.kind.name(),
                self.params.len(),
                self.kind.num_params()
            )));
        }
        let p = &self.params;
        let (focals, principal_point, distortion) = match self.kind {
            CameraKind::SimplePinhole => ((p[0], p[0]), (p[1], p[2]), RadialDistortion::default()),
            CameraKind::Pinhole => ((p[0], p[1]), (p[2], p[3]), RadialDistortion::default()),
            CameraKind::SimpleRadial => {
                ((p[0], p[0]), (p[1], p[2]), RadialDistortion::new(p[3], 0.0))
            }
            CameraKind::Radial => ((p[0], p[0]), (p[1], p[2]), RadialDistortion::new(p[3], p[4])),
        };
        Ok(PinholeCamera::new(
            CameraIntrinsics {
                focals: Vector2::new(focals.0, focals.1),
                principal_point: Point2::new(principal_point.0, principal_point.1),
                skew: 0.0,
            },
            distortion,
        ))
    }
}

/// A 2d observation of an image, optionally associated with a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub keypoint: KeyPoint,
    pub track: Option<TrackId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    /// Path relative to the image directory.
    pub name: String,
    pub camera: CameraId,
    pub pose: WorldToCamera,
    pub observations: Vec<Observation>,
}

/// One observation of a track: the image and the index into its observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackElement {
    pub image: ImageId,
    pub observation: usize,
}

/// A 3d point and the observations it was triangulated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub position: WorldPoint,
    pub color: [u8; 3],
    /// Mean reprojection error in pixels.
    pub error: f64,
    pub elements: Vec<TrackElement>,
}

/// A sparse reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconstruction {
    pub cameras: BTreeMap<CameraId, Camera>,
    pub images: BTreeMap<ImageId, Image>,
    pub tracks: BTreeMap<TrackId, Track>,
}

impl Reconstruction {
    pub fn camera(&self, id: CameraId) -> Result<&Camera> {
        self.cameras
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("camera {}", id)))
    }

    pub fn image(&self, id: ImageId) -> Result<&Image> {
        self.images
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("image {}", id)))
    }

    pub fn image_by_name(&self, name: &str) -> Option<&Image> {
        self.images.values().find(|image| image.name == name)
    }

    /// The observed keypoints of every image by name, in observation order.
    pub fn observed_keypoints(&self) -> HashMap<String, Vec<KeyPoint>> {
        self.images
            .values()
            .map(|image| {
                let keypoints = image
                    .observations
                    .iter()
                    .map(|observation| observation.keypoint)
                    .collect();
                (image.name.clone(), keypoints)
            })
            .collect()
    }

    /// The keypoint of one track element.
    pub fn keypoint(&self, element: TrackElement) -> Result<KeyPoint> {
        self.image(element.image)?
            .observations
            .get(element.observation)
            .map(|observation| observation.keypoint)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "observation {} of image {}",
                    element.observation, element.image
                ))
            })
    }

    /// Number of track elements over all tracks.
    pub fn num_track_elements(&self) -> usize {
        self.tracks.values().map(|track| track.elements.len()).sum()
    }

    /// Reprojection error in pixels of one track element, or `None` if it does not project.
    pub fn reprojection_error(&self, track: &Track, element: TrackElement) -> Result<Option<f64>> {
        let image = self.image(element.image)?;
        let camera = self.camera(image.camera)?.model()?;
        let keypoint = self.keypoint(element)?;
        Ok(camera
            .project(image.pose.transform(track.position))
            .map(|projected| projected.distance(keypoint)))
    }

    /// Root mean square reprojection error over all track elements.
    ///
    /// Elements that do not project contribute nothing. Returns `0.0` without tracks.
    pub fn reprojection_rmse(&self) -> Result<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for track in self.tracks.values() {
            for &element in &track.elements {
                if let Some(error) = self.reprojection_error(track, element)? {
                    sum += error * error;
                    count += 1;
                }
            }
        }
        Ok(if count == 0 {
            0.0
        } else {
            (sum / count as f64).sqrt()
        })
    }

    /// Recomputes the mean reprojection error stored on every track.
    pub fn update_track_errors(&mut self) -> Result<()> {
        let mut errors = Vec::with_capacity(self.tracks.len());
        for track in self.tracks.values() {
            let mut sum = 0.0;
            let mut count = 0usize;
            for &element in &track.elements {
                if let Some(error) = self.reprojection_error(track, element)? {
                    sum += error;
                    count += 1;
                }
            }
            errors.push(if count == 0 { 0.0 } else { sum / count as f64 });
        }
        for (track, error) in self.tracks.values_mut().zip(errors) {
            track.error = error;
        }
        Ok(())
    }

    /// Removes a track and clears the observations that pointed at it.
    pub fn remove_track(&mut self, id: TrackId) -> Option<Track> {
        let track = self.tracks.remove(&id)?;
        for element in &track.elements {
            if let Some(observation) = self
                .images
                .get_mut(&element.image)
                .and_then(|image| image.observations.get_mut(element.observation))
            {
                if observation.track == Some(id) {
                    observation.track = None;
                }
            }
        }
        Some(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::Pose;

    fn two_view() -> Reconstruction {
        let mut reconstruction = Reconstruction::default();
        reconstruction.cameras.insert(
            CameraId(1),
            Camera {
                id: CameraId(1),
                kind: CameraKind::SimplePinhole,
                width: 640,
                height: 480,
                params: vec![500.0, 320.0, 240.0],
            },
        );
        let track = Track {
            id: TrackId(7),
            position: WorldPoint::new(0.0, 0.0, 5.0),
            color: [10, 20, 30],
            error: 0.0,
            elements: vec![
                TrackElement {
                    image: ImageId(1),
                    observation: 0,
                },
                TrackElement {
                    image: ImageId(2),
                    observation: 0,
                },
            ],
        };
        for id in 1..=2 {
            reconstruction.images.insert(
                ImageId(id),
                Image {
                    id: ImageId(id),
                    name: format!("{}.png", id),
                    camera: CameraId(1),
                    pose: WorldToCamera::identity(),
                    observations: vec![Observation {
                        keypoint: KeyPoint::new(323.0, 244.0),
                        track: Some(TrackId(7)),
                    }],
                },
            );
        }
        reconstruction.tracks.insert(track.id, track);
        reconstruction
    }

    #[test]
    fn rmse_of_offset_observations() {
        let reconstruction = two_view();
        assert!((reconstruction.reprojection_rmse().unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn remove_track_clears_observations() {
        let mut reconstruction = two_view();
        assert!(reconstruction.remove_track(TrackId(7)).is_some());
        assert!(reconstruction
            .images
            .values()
            .all(|image| image.observations[0].track.is_none()));
        assert_eq!(reconstruction.reprojection_rmse().unwrap(), 0.0);
    }

    #[test]
    fn observed_keypoints_by_name() {
        let keypoints = two_view().observed_keypoints();
        assert_eq!(keypoints.len(), 2);
        assert_eq!(keypoints["1.png"], vec![KeyPoint::new(323.0, 244.0)]);
    }

    #[test]
    fn wrong_parameter_count() {
        let camera = Camera {
            id: CameraId(3),
            kind: CameraKind::Radial,
            width: 10,
            height: 10,
            params: vec![1.0, 2.0],
        };
        assert!(matches!(camera.model(), Err(Error::Config(_))));
    }
}
