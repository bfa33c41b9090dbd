use crate::{Error, FeatureSet, FeatureStore, MatchStore, MatcherSettings, Result, ScorerSettings};
use cv_core::FeatureMatch;
use log::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Turns two descriptors into a match confidence. Higher is better.
pub trait Scorer {
    fn score(&self, a: &[f32], b: &[f32]) -> f32;
}

impl<T> Scorer for Box<T>
where
    T: Scorer + ?Sized,
{
    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        (**self).score(a, b)
    }
}

/// Cosine similarity in `[-1, 1]`. Zero descriptors score `0.0`.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct CosineScorer;

impl Scorer for CosineScorer {
    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(a, b)| a * b).sum();
        let norms = a.iter().map(|v| v * v).sum::<f32>().sqrt()
            * b.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norms > 0.0 {
            dot / norms
        } else {
            0.0
        }
    }
}

/// `exp(-|a - b|^2 / (2 sigma^2))`, in `(0, 1]`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GaussianL2Scorer {
    pub sigma: f32,
}

impl Scorer for GaussianL2Scorer {
    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        let distance_squared: f32 = a.iter().zip(b).map(|(a, b)| (a - b) * (a - b)).sum();
        (-distance_squared / (2.0 * self.sigma * self.sigma)).exp()
    }
}

/// The matches between the keypoints of two images, oriented from `a` to `b`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Correspondences {
    pub matches: Vec<FeatureMatch<usize>>,
    /// Confidence of each match.
    pub confidences: Vec<f32>,
}

impl Correspondences {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// The same correspondences oriented from `b` to `a`.
    #[must_use]
    pub fn swapped(self) -> Self {
        Self {
            matches: self.matches.into_iter().map(FeatureMatch::swap).collect(),
            confidences: self.confidences,
        }
    }
}

/// Finds correspondences between the features of two images.
///
/// Returns [`Error::NoMatchFound`] when no correspondence survives.
pub trait Matcher {
    fn match_features(&self, a: &FeatureSet, b: &FeatureSet) -> Result<Correspondences>;
}

/// Matches every feature to its most confident counterpart in the other image.
#[derive(Debug, Clone)]
pub struct NearestNeighborMatcher<S> {
    pub scorer: S,
    pub threshold: f32,
    pub mutual_check: bool,
    pub ratio_test: Option<f32>,
    pub min_matches: usize,
}

impl<S> NearestNeighborMatcher<S> {
    pub fn new(scorer: S, settings: MatcherSettings) -> Self {
        Self {
            scorer,
            threshold: settings.threshold,
            mutual_check: settings.mutual_check,
            ratio_test: settings.ratio_test,
            min_matches: settings.min_matches,
        }
    }
}

impl NearestNeighborMatcher<Box<dyn Scorer + Send + Sync>> {
    /// Builds the matcher with the scorer named in the settings.
    pub fn from_settings(settings: MatcherSettings) -> Result<Self> {
        settings.validate()?;
        let scorer: Box<dyn Scorer + Send + Sync> = match settings.scorer {
            ScorerSettings::Cosine => Box::new(CosineScorer),
            ScorerSettings::GaussianL2 { sigma } => Box::new(GaussianL2Scorer { sigma }),
        };
        Ok(Self::new(scorer, settings))
    }
}

impl<S> NearestNeighborMatcher<S>
where
    S: Scorer + Sync,
{
    /// The best sufficient match in `b` of every feature in `a`, with its confidence.
    fn matching(&self, scores: &[Vec<f32>]) -> Vec<Option<(usize, f32)>> {
        scores
            .iter()
            .map(|row| {
                let mut best: Option<(usize, f32)> = None;
                let mut second = f32::NEG_INFINITY;
                for (ix, &score) in row.iter().enumerate() {
                    match best {
                        Some((_, best_score)) if score <= best_score => second = second.max(score),
                        Some((_, best_score)) => {
                            second = best_score;
                            best = Some((ix, score));
                        }
                        None => best = Some((ix, score)),
                    }
                }
                best.filter(|&(_, score)| score >= self.threshold)
                    .filter(|&(_, score)| match self.ratio_test {
                        Some(ratio) => second <= ratio * score,
                        None => true,
                    })
            })
            .collect()
    }
}

impl<S> Matcher for NearestNeighborMatcher<S>
where
    S: Scorer + Sync,
{
    fn match_features(&self, a: &FeatureSet, b: &FeatureSet) -> Result<Correspondences> {
        let no_match = || {
            Error::NoMatchFound(
                format!("{} features", a.len()),
                format!("{} features", b.len()),
            )
        };
        if a.is_empty() || b.is_empty() {
            return Err(no_match());
        }

        let scores: Vec<Vec<f32>> = a
            .descriptors
            .par_iter()
            .map(|da| {
                b.descriptors
                    .iter()
                    .map(|db| self.scorer.score(da, db))
                    .collect()
            })
            .collect();
        let forward = self.matching(&scores);
        let reverse = if self.mutual_check {
            let transposed: Vec<Vec<f32>> = (0..b.len())
                .map(|bix| scores.iter().map(|row| row[bix]).collect())
                .collect();
            Some(self.matching(&transposed))
        } else {
            None
        };

        let mut correspondences = Correspondences::default();
        for (aix, best) in forward.into_iter().enumerate() {
            if let Some((bix, confidence)) = best {
                let mutual = reverse
                    .as_ref()
                    .map(|reverse| matches!(reverse[bix], Some((rix, _)) if rix == aix))
                    .unwrap_or(true);
                if mutual {
                    correspondences.matches.push(FeatureMatch(aix, bix));
                    correspondences.confidences.push(confidence);
                }
            }
        }

        if correspondences.is_empty() || correspondences.len() < self.min_matches {
            return Err(no_match());
        }
        Ok(correspondences)
    }
}

/// What [`match_pairs`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingStats {
    pub num_pairs: usize,
    /// Pairs already in the store.
    pub num_skipped: usize,
    pub num_matched: usize,
    pub num_matches: usize,
    /// Pairs for which no correspondence survived.
    pub no_match: Vec<(String, String)>,
}

/// Matches the features of every named pair into the store.
///
/// Pairs without any surviving correspondence are recorded in the stats and the rest of the batch
/// carries on. Missing features abort the batch.
pub fn match_pairs<M>(
    matcher: &M,
    pairs: &[(String, String)],
    features: &FeatureStore,
    matches: &MatchStore,
    overwrite: bool,
) -> Result<MatchingStats>
where
    M: Matcher + Sync,
{
    let todo: Vec<&(String, String)> = pairs
        .iter()
        .filter(|(a, b)| overwrite || !matches.contains(a, b))
        .collect();
    let mut stats = MatchingStats {
        num_pairs: pairs.len(),
        num_skipped: pairs.len() - todo.len(),
        ..MatchingStats::default()
    };
    info!(
        "matching {} pairs ({} already present)",
        todo.len(),
        stats.num_skipped
    );

    let results = todo
        .par_iter()
        .map(|&(a, b)| -> Result<_> {
            let features_a = features.get(a)?;
            let features_b = features.get(b)?;
            match matcher.match_features(&features_a, &features_b) {
                Ok(correspondences) => Ok((a, b, Some(correspondences))),
                Err(Error::NoMatchFound(..)) => Ok((a, b, None)),
                Err(e) => Err(e),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    for (a, b, correspondences) in results {
        match correspondences {
            Some(correspondences) => {
                trace!("{} {}: {} matches", a, b, correspondences.len());
                stats.num_matched += 1;
                stats.num_matches += correspondences.len();
                matches.put(a, b, correspondences);
            }
            None => {
                debug!("{}", Error::NoMatchFound(a.clone(), b.clone()));
                stats.no_match.push((a.clone(), b.clone()));
            }
        }
    }
    if !stats.no_match.is_empty() {
        warn!("{} pairs had no match", stats.no_match.len());
    }
    Ok(stats)
}
