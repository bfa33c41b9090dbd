mod common;

use cv_core::FeatureMatch;
use cv_sfm::{
    extract_features, list_images, Correspondences, Error, FastPatchExtractor, FeatureStore,
    KeyValueStore, MatchStore, ReconstructionStore,
};
use std::collections::HashMap;

#[test]
fn key_value_store_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.bin");
    let store = KeyValueStore::<String, Vec<u32>>::open(&path).unwrap();
    assert!(store.is_empty());
    store.put("b".into(), vec![1, 2]);
    store.put("a".into(), vec![3]);
    store.flush().unwrap();

    let reopened = KeyValueStore::<String, Vec<u32>>::open(&path).unwrap();
    assert_eq!(reopened.keys(), vec!["b".to_owned(), "a".to_owned()]);
    assert_eq!(reopened.get(&"a".to_owned()).unwrap(), vec![3]);
    assert!(matches!(
        reopened.get(&"c".to_owned()),
        Err(Error::NotFound(_))
    ));
    assert!(!dir.path().join("nested").join("store.bin.tmp").exists());
}

#[test]
fn corrupt_store_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.bin");
    std::fs::write(&path, [1u8, 2, 3]).unwrap();
    assert!(KeyValueStore::<String, u32>::open(&path).is_err());
}

#[test]
fn match_store_keeps_caller_orientation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("matches.bin");
    let store = MatchStore::open(&path).unwrap();
    let correspondences = Correspondences {
        matches: vec![FeatureMatch(0, 5), FeatureMatch(3, 1)],
        confidences: vec![0.9, 0.8],
    };
    store.put("z.png", "a.png", correspondences.clone());
    store.flush().unwrap();

    let store = MatchStore::open(&path).unwrap();
    assert!(store.contains("a.png", "z.png"));
    assert_eq!(store.get("z.png", "a.png").unwrap(), correspondences);
    assert_eq!(
        store.get("a.png", "z.png").unwrap().matches,
        vec![FeatureMatch(5, 0), FeatureMatch(1, 3)]
    );
    assert!(matches!(store.get("a.png", "b.png"), Err(Error::NotFound(_))));
}

#[test]
fn colmap_text_round_trip() {
    let mut reference = common::reference(0.3, 9);
    common::add_bad_tracks(&mut reference);
    reference.update_track_errors().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = ReconstructionStore::new(dir.path().join("model"));
    assert!(!store.exists());
    store.write(&reference).unwrap();
    assert!(store.exists());

    let read = store.read().unwrap();
    assert_eq!(read.cameras, reference.cameras);
    assert_eq!(read.tracks, reference.tracks);
    for (id, image) in &reference.images {
        let other = &read.images[id];
        assert_eq!(other.name, image.name);
        assert_eq!(other.observations, image.observations);
        approx::assert_relative_eq!(other.pose.0, image.pose.0, epsilon = 1e-12);
    }
}

#[test]
fn colmap_parse_errors_name_the_line() {
    let dir = tempfile::tempdir().unwrap();
    let store = ReconstructionStore::new(dir.path());
    store.write(&common::reference(0.0, 1)).unwrap();
    std::fs::write(
        dir.path().join("cameras.txt"),
        "# header\n1 PINHOLE 640 480 500 500 320\n",
    )
    .unwrap();
    match store.read() {
        Err(Error::Parse { line, .. }) => assert_eq!(line, 2),
        other => panic!("unexpected {:?}", other.map(|model| model.tracks.len())),
    }
    std::fs::write(
        dir.path().join("cameras.txt"),
        "1 OPENCV_FISHEYE 640 480 500 500 320 240\n",
    )
    .unwrap();
    assert!(matches!(store.read(), Err(Error::Parse { line: 1, .. })));
}

#[test]
fn extraction_is_idempotent() {
    let reference = common::reference(0.0, 1);
    let images = tempfile::tempdir().unwrap();
    common::write_images(&reference, images.path());
    let names = list_images(images.path()).unwrap();
    assert_eq!(names, vec!["img1.png", "img2.png", "img3.png", "img4.png", "img5.png"]);

    let dir = tempfile::tempdir().unwrap();
    let store = FeatureStore::open(dir.path().join("features.bin")).unwrap();
    let extractor = FastPatchExtractor {
        threshold: 10,
        max_keypoints: 200,
        patch_size: 8,
    };
    let seeds = reference.observed_keypoints();
    let extract = |store: &FeatureStore, overwrite| {
        extract_features(&extractor, images.path(), &names, &seeds, store, overwrite).unwrap()
    };
    assert_eq!(extract(&store, false), 5);
    let first = store.get(&names[0]).unwrap();
    let observed = &seeds[&names[0]];
    assert_eq!(&first.keypoints[..observed.len()], &observed[..]);
    assert!(first.len() <= observed.len() + 200);
    store.flush().unwrap();

    let store = FeatureStore::open(dir.path().join("features.bin")).unwrap();
    assert_eq!(extract(&store, false), 0);
    assert_eq!(store.get(&names[0]).unwrap(), first);
    assert_eq!(extract(&store, true), 5);
    assert_eq!(store.get(&names[0]).unwrap(), first);

    let unseeded = FeatureStore::in_memory();
    extract_features(&extractor, images.path(), &names, &HashMap::new(), &unseeded, false).unwrap();
    assert!(first.len() <= unseeded.get(&names[0]).unwrap().len() + observed.len());
}
