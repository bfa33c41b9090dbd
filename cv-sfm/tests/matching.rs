use cv_core::{FeatureMatch, KeyPoint};
use cv_sfm::{
    match_pairs, CosineScorer, Error, FeatureSet, FeatureStore, GaussianL2Scorer, MatchStore,
    Matcher, MatcherSettings, NearestNeighborMatcher, Scorer, ScorerSettings,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

fn features(descriptors: Vec<Vec<f32>>) -> FeatureSet {
    FeatureSet {
        keypoints: (0..descriptors.len())
            .map(|ix| KeyPoint::new(ix as f64, 0.0))
            .collect(),
        scores: vec![1.0; descriptors.len()],
        descriptors,
        width: 100,
        height: 100,
    }
}

fn random_descriptors(rng: &mut Pcg64, count: usize) -> Vec<Vec<f32>> {
    (0..count)
        .map(|_| (0..16).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

#[test]
fn scorers() {
    let a = [1.0, 0.0];
    let b = [0.0, 2.0];
    assert!((CosineScorer.score(&a, &a) - 1.0).abs() < 1e-6);
    assert!(CosineScorer.score(&a, &b).abs() < 1e-6);
    assert_eq!(CosineScorer.score(&a, &[0.0, 0.0]), 0.0);
    let gaussian = GaussianL2Scorer { sigma: 1.0 };
    assert!((gaussian.score(&a, &a) - 1.0).abs() < 1e-6);
    assert!((gaussian.score(&a, &b) - (-2.5f32).exp()).abs() < 1e-6);
}

#[test]
fn permuted_descriptors_are_recovered() {
    let mut rng = Pcg64::seed_from_u64(4);
    let a = random_descriptors(&mut rng, 30);
    let permutation: Vec<usize> = (0..30).map(|ix| (ix * 7) % 30).collect();
    let b = permutation.iter().map(|&ix| a[ix].clone()).collect();

    let matcher = NearestNeighborMatcher::from_settings(MatcherSettings::default()).unwrap();
    let correspondences = matcher.match_features(&features(a), &features(b)).unwrap();
    assert_eq!(correspondences.len(), 30);
    for (bix, &aix) in permutation.iter().enumerate() {
        assert!(correspondences.matches.contains(&FeatureMatch(aix, bix)));
    }
    assert!(correspondences.confidences.iter().all(|&c| c > 0.999));
}

#[test]
fn mutual_check_rejects_one_sided_matches() {
    // Both features of `a` prefer the single feature of `b`, which prefers the first.
    let a = features(vec![vec![1.0, 0.0], vec![0.9, 0.1]]);
    let b = features(vec![vec![1.0, 0.0]]);
    let settings = MatcherSettings {
        threshold: 0.5,
        ..MatcherSettings::default()
    };
    let matcher = NearestNeighborMatcher::new(CosineScorer, settings);
    let correspondences = matcher.match_features(&a, &b).unwrap();
    assert_eq!(correspondences.matches, vec![FeatureMatch(0, 0)]);

    let matcher = NearestNeighborMatcher::new(
        CosineScorer,
        MatcherSettings {
            mutual_check: false,
            ..settings
        },
    );
    assert_eq!(matcher.match_features(&a, &b).unwrap().len(), 2);
}

#[test]
fn ratio_test_rejects_ambiguous_matches() {
    let a = features(vec![vec![1.0, 0.0]]);
    let b = features(vec![vec![1.0, 0.05], vec![1.0, -0.05]]);
    let settings = MatcherSettings {
        threshold: 0.5,
        mutual_check: false,
        ratio_test: Some(0.8),
        ..MatcherSettings::default()
    };
    let matcher = NearestNeighborMatcher::new(CosineScorer, settings);
    assert!(matches!(
        matcher.match_features(&a, &b),
        Err(Error::NoMatchFound(..))
    ));
}

#[test]
fn threshold_and_min_matches() {
    let a = features(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    let b = features(vec![vec![1.0, 0.0], vec![-1.0, 0.0]]);
    let matcher = NearestNeighborMatcher::from_settings(MatcherSettings {
        scorer: ScorerSettings::Cosine,
        threshold: 0.9,
        ..MatcherSettings::default()
    })
    .unwrap();
    assert_eq!(matcher.match_features(&a, &b).unwrap().len(), 1);
    let matcher = NearestNeighborMatcher::from_settings(MatcherSettings {
        threshold: 0.9,
        min_matches: 2,
        ..MatcherSettings::default()
    })
    .unwrap();
    assert!(matches!(
        matcher.match_features(&a, &b),
        Err(Error::NoMatchFound(..))
    ));
    assert!(matches!(
        matcher.match_features(&a, &features(vec![])),
        Err(Error::NoMatchFound(..))
    ));
}

#[test]
fn batch_matching_records_failures_and_skips_done_pairs() {
    let mut rng = Pcg64::seed_from_u64(8);
    let shared = random_descriptors(&mut rng, 20);
    let store = FeatureStore::in_memory();
    store.put("a".into(), features(shared.clone()));
    store.put("b".into(), features(shared.iter().rev().cloned().collect()));
    store.put("empty".into(), features(vec![]));
    let pairs = vec![
        ("a".to_owned(), "b".to_owned()),
        ("a".to_owned(), "empty".to_owned()),
    ];
    let matches = MatchStore::in_memory();
    let matcher = NearestNeighborMatcher::from_settings(MatcherSettings::default()).unwrap();

    let stats = match_pairs(&matcher, &pairs, &store, &matches, false).unwrap();
    assert_eq!(stats.num_matched, 1);
    assert_eq!(stats.num_matches, 20);
    assert_eq!(stats.no_match, vec![("a".to_owned(), "empty".to_owned())]);
    assert_eq!(
        matches.get("b", "a").unwrap().matches[0],
        FeatureMatch(19, 0)
    );

    let stats = match_pairs(&matcher, &pairs, &store, &matches, false).unwrap();
    assert_eq!(stats.num_skipped, 1);
    assert_eq!(stats.num_matched, 0);

    let missing = vec![("a".to_owned(), "nope".to_owned())];
    assert!(matches!(
        match_pairs(&matcher, &missing, &store, &matches, false),
        Err(Error::NotFound(_))
    ));
}
