//! A synthetic scene: a textured plane at `z = 5` seen by five cameras.

#![allow(dead_code)]

use cv_core::nalgebra::{Rotation3, Vector3};
use cv_core::{CameraModel, CameraPoint, FeatureMatch, KeyPoint, Pose, WorldPoint, WorldToCamera};
use cv_sfm::{
    Camera, CameraId, CameraKind, Correspondences, FeatureSet, FeatureStore, Image, ImageId,
    MatchStore, Observation, Reconstruction, Track, TrackElement, TrackId,
};
use image::{DynamicImage, ImageBuffer, Luma};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::f64::consts::PI;
use std::path::Path;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const PLANE_DEPTH: f64 = 5.0;
pub const GRID: usize = 7;

pub fn camera() -> Camera {
    Camera {
        id: CameraId(1),
        kind: CameraKind::Pinhole,
        width: WIDTH,
        height: HEIGHT,
        params: vec![500.0, 500.0, 320.0, 240.0],
    }
}

pub fn poses() -> Vec<WorldToCamera> {
    (0..5)
        .map(|i| {
            let x = i as f64 * 0.3 - 0.6;
            let rotation = Rotation3::from_euler_angles(0.01 * x, -0.02 * x, 0.005 * i as f64);
            WorldToCamera::from_parts(-(rotation * Vector3::new(x, 0.05 * x, 0.0)), rotation)
        })
        .collect()
}

/// Smooth intensity of the plane in `[0, 1]`.
pub fn texture(x: f64, y: f64) -> f64 {
    0.5 + 0.2 * (2.0 * PI * x / 0.35).sin() * (2.0 * PI * y / 0.3).cos()
        + 0.15 * (2.0 * PI * (x + 0.7 * y) / 0.5).sin()
}

/// Renders the plane as seen by a camera. Pixel `(u, v)` samples the ray through its center.
pub fn render(pose: WorldToCamera) -> DynamicImage {
    let model = camera().model().unwrap();
    let center = pose.optical_center();
    let to_world = pose.inverse();
    DynamicImage::ImageLuma8(ImageBuffer::from_fn(WIDTH, HEIGHT, |u, v| {
        let bearing = model.calibrate(KeyPoint::new(u as f64 + 0.5, v as f64 + 0.5));
        let direction = to_world.isometry().rotation * bearing.into_inner();
        let s = (PLANE_DEPTH - center.0.z) / direction.z;
        let hit = center.0 + direction * s;
        Luma([(texture(hit.x, hit.y) * 255.0).round().clamp(0.0, 255.0) as u8])
    }))
}

pub fn grid_points() -> Vec<WorldPoint> {
    let mut points = vec![];
    for row in 0..GRID {
        for col in 0..GRID {
            let x = -0.9 + 1.8 * col as f64 / (GRID - 1) as f64;
            let y = -0.6 + 1.2 * row as f64 / (GRID - 1) as f64;
            points.push(WorldPoint::new(x, y, PLANE_DEPTH));
        }
    }
    points
}

pub fn project(pose: WorldToCamera, point: WorldPoint) -> KeyPoint {
    let in_camera: CameraPoint = pose.transform(point);
    camera().model().unwrap().project(in_camera).unwrap()
}

/// The ground truth model with every grid point observed in every image, with keypoint noise of
/// up to `noise` pixels along each axis.
pub fn reference(noise: f64, seed: u64) -> Reconstruction {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut reconstruction = Reconstruction::default();
    reconstruction.cameras.insert(CameraId(1), camera());
    let points = grid_points();
    for (ix, &pose) in poses().iter().enumerate() {
        let id = ImageId(ix as u32 + 1);
        let observations = points
            .iter()
            .enumerate()
            .map(|(track, &point)| {
                let exact = project(pose, point);
                let (dx, dy) = if noise > 0.0 {
                    (rng.gen_range(-noise..noise), rng.gen_range(-noise..noise))
                } else {
                    (0.0, 0.0)
                };
                Observation {
                    keypoint: KeyPoint::new(exact.x + dx, exact.y + dy),
                    track: Some(TrackId(track as u32 + 1)),
                }
            })
            .collect();
        reconstruction.images.insert(
            id,
            Image {
                id,
                name: image_name(id),
                camera: CameraId(1),
                pose,
                observations,
            },
        );
    }
    for (ix, &point) in points.iter().enumerate() {
        let id = TrackId(ix as u32 + 1);
        reconstruction.tracks.insert(
            id,
            Track {
                id,
                position: point,
                color: [128, 128, 128],
                error: 0.0,
                elements: (1..=5)
                    .map(|image| TrackElement {
                        image: ImageId(image),
                        observation: ix,
                    })
                    .collect(),
            },
        );
    }
    reconstruction
}

pub fn image_name(id: ImageId) -> String {
    format!("img{}.png", id)
}

/// Adds a track observed twice in the same image, and a track whose observations have no detected
/// keypoint nearby.
pub fn add_bad_tracks(reconstruction: &mut Reconstruction) -> (TrackId, TrackId) {
    let degenerate = TrackId(1000);
    let missing = TrackId(1001);
    let point = WorldPoint::new(0.15, 0.1, PLANE_DEPTH);

    let image = reconstruction.images.get_mut(&ImageId(1)).unwrap();
    let keypoint = project(image.pose, point);
    let first = image.observations.len();
    for _ in 0..2 {
        image.observations.push(Observation {
            keypoint,
            track: Some(degenerate),
        });
    }
    reconstruction.tracks.insert(
        degenerate,
        Track {
            id: degenerate,
            position: point,
            color: [0, 0, 0],
            error: 0.0,
            elements: vec![
                TrackElement {
                    image: ImageId(1),
                    observation: first,
                },
                TrackElement {
                    image: ImageId(1),
                    observation: first + 1,
                },
            ],
        },
    );

    let mut elements = vec![];
    for id in [ImageId(2), ImageId(3)] {
        let image = reconstruction.images.get_mut(&id).unwrap();
        elements.push(TrackElement {
            image: id,
            observation: image.observations.len(),
        });
        image.observations.push(Observation {
            keypoint: project(image.pose, point),
            track: Some(missing),
        });
    }
    reconstruction.tracks.insert(
        missing,
        Track {
            id: missing,
            position: point,
            color: [0, 0, 0],
            error: 0.0,
            elements,
        },
    );
    (degenerate, missing)
}

/// Features at the grid observations of every image, in observation order.
pub fn features(reconstruction: &Reconstruction) -> FeatureStore {
    let store = FeatureStore::in_memory();
    for image in reconstruction.images.values() {
        let keypoints: Vec<KeyPoint> = image
            .observations
            .iter()
            .take(GRID * GRID)
            .map(|observation| observation.keypoint)
            .collect();
        store.put(
            image.name.clone(),
            FeatureSet {
                descriptors: vec![vec![1.0]; keypoints.len()],
                scores: vec![1.0; keypoints.len()],
                keypoints,
                width: WIDTH,
                height: HEIGHT,
            },
        );
    }
    store
}

/// Matches of the grid tracks between every pair of images.
pub fn matches(reconstruction: &Reconstruction) -> MatchStore {
    let store = MatchStore::in_memory();
    let images: Vec<&Image> = reconstruction.images.values().collect();
    for (ix, a) in images.iter().enumerate() {
        for b in &images[ix + 1..] {
            store.put(
                &a.name,
                &b.name,
                Correspondences {
                    matches: (0..GRID * GRID).map(|k| FeatureMatch(k, k)).collect(),
                    confidences: vec![1.0; GRID * GRID],
                },
            );
        }
    }
    store
}

pub fn write_images(reconstruction: &Reconstruction, dir: &Path) {
    for image in reconstruction.images.values() {
        render(image.pose).save(dir.join(&image.name)).unwrap();
    }
}
