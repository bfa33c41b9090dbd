use cv_core::{KeyPoint, Pose, WorldPoint, WorldToCamera};
use cv_sfm::{
    read_pairs, resolve_pairs, select_covisible_pairs, write_pairs, Camera, CameraId, CameraKind,
    Error, Image, ImageId, Observation, Pair, Reconstruction, Track, TrackElement, TrackId,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::{BTreeSet, HashMap, HashSet};

/// A model whose tracks are observed by random subsets of `num_images` images.
fn random_model(num_images: u32, num_tracks: u32, seed: u64) -> Reconstruction {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut model = Reconstruction::default();
    model.cameras.insert(
        CameraId(1),
        Camera {
            id: CameraId(1),
            kind: CameraKind::SimplePinhole,
            width: 100,
            height: 100,
            params: vec![100.0, 50.0, 50.0],
        },
    );
    for id in 1..=num_images {
        model.images.insert(
            ImageId(id),
            Image {
                id: ImageId(id),
                name: format!("{:03}.jpg", id),
                camera: CameraId(1),
                pose: WorldToCamera::identity(),
                observations: vec![],
            },
        );
    }
    for id in 1..=num_tracks {
        let mut elements = vec![];
        for image in 1..=num_images {
            if rng.gen_bool(0.4) {
                let observations = &mut model.images.get_mut(&ImageId(image)).unwrap().observations;
                elements.push(TrackElement {
                    image: ImageId(image),
                    observation: observations.len(),
                });
                observations.push(Observation {
                    keypoint: KeyPoint::new(10.0, 10.0),
                    track: Some(TrackId(id)),
                });
            }
        }
        model.tracks.insert(
            TrackId(id),
            Track {
                id: TrackId(id),
                position: WorldPoint::new(0.0, 0.0, 1.0),
                color: [0; 3],
                error: 0.0,
                elements,
            },
        );
    }
    model
}

#[test]
fn pairs_are_the_top_neighbors_of_each_image() {
    let model = random_model(12, 200, 1);
    let num_matched = 3;
    let pairs = select_covisible_pairs(&model, num_matched).unwrap();
    assert!(pairs.len() <= 12 * num_matched);
    assert!(pairs.iter().all(|pair| pair.a < pair.b && pair.score > 0));

    // Count shared tracks from the observations of every image.
    let observed: HashMap<ImageId, HashSet<TrackId>> = model
        .images
        .values()
        .map(|image| {
            let tracks = image.observations.iter().filter_map(|o| o.track).collect();
            (image.id, tracks)
        })
        .collect();
    let shared = |a: ImageId, b: ImageId| observed[&a].intersection(&observed[&b]).count();

    // The pairs are exactly the union of every image's top neighbors.
    let mut expected = BTreeSet::new();
    for &image in model.images.keys() {
        let mut ranked: Vec<(usize, ImageId)> = model
            .images
            .keys()
            .filter(|&&other| other != image)
            .map(|&other| (shared(image, other), other))
            .filter(|&(count, _)| count > 0)
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for &(_, other) in ranked.iter().take(num_matched) {
            expected.insert((image.min(other), image.max(other)));
        }
    }
    let selected: BTreeSet<(ImageId, ImageId)> = pairs.iter().map(|pair| (pair.a, pair.b)).collect();
    assert_eq!(selected.len(), pairs.len());
    assert_eq!(selected, expected);
    for pair in &pairs {
        assert_eq!(pair.score, shared(pair.a, pair.b));
    }
}

#[test]
fn selection_is_deterministic() {
    let model = random_model(8, 100, 2);
    let first = select_covisible_pairs(&model, 2).unwrap();
    for _ in 0..3 {
        assert_eq!(select_covisible_pairs(&model, 2).unwrap(), first);
    }
}

#[test]
fn ties_prefer_lower_ids() {
    // Image 1 shares one track with each of 2, 3 and 4.
    let mut model = random_model(4, 0, 0);
    for (track, other) in [(1, 2), (2, 3), (3, 4)] {
        let mut elements = vec![];
        for image in [1, other] {
            let observations = &mut model.images.get_mut(&ImageId(image)).unwrap().observations;
            elements.push(TrackElement {
                image: ImageId(image),
                observation: observations.len(),
            });
            observations.push(Observation {
                keypoint: KeyPoint::new(1.0, 1.0),
                track: Some(TrackId(track)),
            });
        }
        model.tracks.insert(
            TrackId(track),
            Track {
                id: TrackId(track),
                position: WorldPoint::new(0.0, 0.0, 1.0),
                color: [0; 3],
                error: 0.0,
                elements,
            },
        );
    }
    let pairs = select_covisible_pairs(&model, 1).unwrap();
    assert_eq!(
        pairs,
        vec![
            Pair::new(ImageId(1), ImageId(2), 1),
            Pair::new(ImageId(1), ImageId(3), 1),
            Pair::new(ImageId(1), ImageId(4), 1),
        ]
    );
}

#[test]
fn degenerate_inputs() {
    let model = random_model(1, 10, 3);
    assert!(matches!(
        select_covisible_pairs(&model, 5),
        Err(Error::InsufficientData(_))
    ));
    let model = random_model(5, 10, 3);
    assert!(matches!(
        select_covisible_pairs(&model, 0),
        Err(Error::Config(_))
    ));
}

#[test]
fn pairs_file_round_trip() {
    let model = random_model(6, 60, 4);
    let pairs = select_covisible_pairs(&model, 2).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pairs.txt");
    write_pairs(&path, &pairs, &model).unwrap();

    let names = read_pairs(&path).unwrap();
    assert_eq!(names.len(), pairs.len());
    assert_eq!(names[0].0, model.images[&pairs[0].a].name);
    let resolved = resolve_pairs(&names, &model);
    assert_eq!(
        resolved.iter().map(|pair| (pair.a, pair.b)).collect::<Vec<_>>(),
        pairs.iter().map(|pair| (pair.a, pair.b)).collect::<Vec<_>>()
    );
}

#[test]
fn malformed_pairs_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pairs.txt");
    std::fs::write(&path, "# comment\n\na.jpg b.jpg\na.jpg\n").unwrap();
    match read_pairs(&path) {
        Err(Error::Parse { line, .. }) => assert_eq!(line, 4),
        other => panic!("unexpected {:?}", other),
    }
}
