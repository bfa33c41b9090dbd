use crate::{Error, ImageId, Result};
use cv_optimize::RobustLoss;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage precision of dense feature maps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    F32,
    F16,
}

/// Sparse feature extraction strategy.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ExtractorSettings {
    /// FAST-9 corners described by their normalized intensity patch.
    FastPatch {
        /// The intensity difference threshold of the FAST segment test
        #[serde(default = "default_fast_threshold")]
        threshold: u8,
        /// The number of highest scoring corners kept per image
        #[serde(default = "default_max_keypoints")]
        max_keypoints: usize,
        /// The side of the square intensity patch used as the descriptor
        #[serde(default = "default_descriptor_patch_size")]
        patch_size: usize,
    },
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        ExtractorSettings::FastPatch {
            threshold: default_fast_threshold(),
            max_keypoints: default_max_keypoints(),
            patch_size: default_descriptor_patch_size(),
        }
    }
}

/// How two descriptors are turned into a match confidence.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ScorerSettings {
    Cosine,
    GaussianL2 {
        #[serde(default = "default_gaussian_sigma")]
        sigma: f32,
    },
}

impl Default for ScorerSettings {
    fn default() -> Self {
        ScorerSettings::Cosine
    }
}

/// The settings of the descriptor matcher.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherSettings {
    #[serde(default)]
    pub scorer: ScorerSettings,
    /// The minimum confidence of a match
    #[serde(default = "default_match_threshold")]
    pub threshold: f32,
    /// Only keep matches that are the best in both directions
    #[serde(default = "default_mutual_check")]
    pub mutual_check: bool,
    /// Reject a match when the second best confidence is above this fraction of the best one
    #[serde(default)]
    pub ratio_test: Option<f32>,
    /// The minimum number of matches for a pair to count as matched
    #[serde(default = "default_min_matches")]
    pub min_matches: usize,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            scorer: ScorerSettings::default(),
            threshold: default_match_threshold(),
            mutual_check: default_mutual_check(),
            ratio_test: None,
            min_matches: default_min_matches(),
        }
    }
}

/// Dense feature extraction strategy used by keypoint adjustment.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum DenseSettings {
    /// Blurred intensity and its two Sobel gradients.
    Gradient {
        /// The standard deviation of the Gaussian blur in pixels
        #[serde(default = "default_dense_sigma")]
        sigma: f32,
    },
}

impl Default for DenseSettings {
    fn default() -> Self {
        DenseSettings::Gradient {
            sigma: default_dense_sigma(),
        }
    }
}

/// The settings of the reconstruction refiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinerSettings {
    #[serde(default)]
    pub dense: DenseSettings,
    /// Reuse dense maps already present in the cache directory
    #[serde(default)]
    pub use_cache: bool,
    /// The storage precision of dense maps
    #[serde(default = "default_dtype")]
    pub dtype: Dtype,
    /// Stream dense maps from `cache_dir` instead of holding all of them in memory
    #[serde(default)]
    pub low_memory: bool,
    /// The directory dense maps are written to
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// The number of tracks adjusted per batch of loaded dense maps
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// The maximum number of iterations of each optimizer
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// The relative cost decrease that terminates each optimizer
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// The side of the square window of dense samples compared between keypoints
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    /// The robust loss of the featuremetric residuals
    #[serde(default = "default_keypoint_loss")]
    pub keypoint_loss: RobustLoss,
    /// The maximum distance in pixels a keypoint may move during adjustment
    #[serde(default = "default_max_displacement")]
    pub max_displacement: f64,
    /// The maximum distance in pixels between a reference observation and a detected keypoint
    #[serde(default = "default_association_radius")]
    pub association_radius: f64,
    /// The minimum angle between any two rays of a track for it to be triangulated
    #[serde(default = "default_min_triangulation_angle_deg")]
    pub min_triangulation_angle_deg: f64,
    /// The robust loss of the reprojection residuals in pixels
    #[serde(default = "default_bundle_loss")]
    pub bundle_loss: RobustLoss,
    /// Refine camera poses in bundle adjustment, otherwise only track positions move
    #[serde(default = "default_refine_poses")]
    pub refine_poses: bool,
    /// Images whose pose is always held fixed
    #[serde(default)]
    pub fixed_images: Vec<ImageId>,
    /// The number of images with the lowest ids whose pose is held fixed
    #[serde(default = "default_num_fixed_images")]
    pub num_fixed_images: usize,
    /// The number of keypoint adjustment and bundle adjustment passes
    #[serde(default = "default_alternations")]
    pub alternations: usize,
}

impl Default for RefinerSettings {
    fn default() -> Self {
        Self {
            dense: DenseSettings::default(),
            use_cache: false,
            dtype: default_dtype(),
            low_memory: false,
            cache_dir: None,
            batch_size: default_batch_size(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            patch_size: default_patch_size(),
            keypoint_loss: default_keypoint_loss(),
            max_displacement: default_max_displacement(),
            association_radius: default_association_radius(),
            min_triangulation_angle_deg: default_min_triangulation_angle_deg(),
            bundle_loss: default_bundle_loss(),
            refine_poses: default_refine_poses(),
            fixed_images: vec![],
            num_fixed_images: default_num_fixed_images(),
            alternations: default_alternations(),
        }
    }
}

impl RefinerSettings {
    /// Half precision dense maps streamed from `cache_dir`.
    pub fn low_memory(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            low_memory: true,
            dtype: Dtype::F16,
            cache_dir: Some(cache_dir.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(Error::Config(message.to_owned()));
        if self.patch_size == 0 {
            return fail("patch_size must be at least 1");
        }
        if self.max_iterations == 0 {
            return fail("max_iterations must be at least 1");
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return fail("tolerance must be positive");
        }
        if !(self.max_displacement.is_finite() && self.max_displacement > 0.0) {
            return fail("max_displacement must be positive");
        }
        if !(self.association_radius.is_finite() && self.association_radius > 0.0) {
            return fail("association_radius must be positive");
        }
        if !(0.0..180.0).contains(&self.min_triangulation_angle_deg) {
            return fail("min_triangulation_angle_deg must be in [0, 180)");
        }
        if !self.keypoint_loss.is_valid() || !self.bundle_loss.is_valid() {
            return fail("robust loss scales must be positive");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1");
        }
        if self.alternations == 0 {
            return fail("alternations must be at least 1");
        }
        if (self.low_memory || self.use_cache) && self.cache_dir.is_none() {
            return fail("low_memory and use_cache require a cache_dir");
        }
        match self.dense {
            DenseSettings::Gradient { sigma } if !(sigma.is_finite() && sigma >= 0.0) => {
                fail("dense sigma must be non-negative")
            }
            _ => Ok(()),
        }
    }
}

impl MatcherSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(Error::Config("matcher threshold must be finite".into()));
        }
        if let Some(ratio) = self.ratio_test {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(Error::Config("ratio_test must be in (0, 1]".into()));
            }
        }
        if let ScorerSettings::GaussianL2 { sigma } = self.scorer {
            if !(sigma.is_finite() && sigma > 0.0) {
                return Err(Error::Config("gaussian sigma must be positive".into()));
            }
        }
        Ok(())
    }
}

impl ExtractorSettings {
    pub fn validate(&self) -> Result<()> {
        match *self {
            ExtractorSettings::FastPatch {
                max_keypoints,
                patch_size,
                ..
            } => {
                if max_keypoints == 0 {
                    Err(Error::Config("max_keypoints must be at least 1".into()))
                } else if patch_size < 2 {
                    Err(Error::Config("descriptor patch_size must be at least 2".into()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// The settings of the whole pipeline, loaded from JSON by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// The number of most covisible images matched against each image
    #[serde(default = "default_num_matched")]
    pub num_matched: usize,
    #[serde(default)]
    pub extractor: ExtractorSettings,
    #[serde(default)]
    pub matcher: MatcherSettings,
    /// Refiner settings. `cache_dir` defaults to `dense/` under the output directory.
    #[serde(default = "default_pipeline_refiner")]
    pub refiner: RefinerSettings,
    /// Recompute stage outputs that already exist
    #[serde(default)]
    pub overwrite: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            num_matched: default_num_matched(),
            extractor: ExtractorSettings::default(),
            matcher: MatcherSettings::default(),
            refiner: default_pipeline_refiner(),
            overwrite: false,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.num_matched == 0 {
            return Err(Error::Config("num_matched must be at least 1".into()));
        }
        self.extractor.validate()?;
        self.matcher.validate()
    }
}

fn default_fast_threshold() -> u8 {
    20
}

fn default_max_keypoints() -> usize {
    4096
}

fn default_descriptor_patch_size() -> usize {
    8
}

fn default_gaussian_sigma() -> f32 {
    1.0
}

fn default_match_threshold() -> f32 {
    0.7
}

fn default_mutual_check() -> bool {
    true
}

fn default_min_matches() -> usize {
    1
}

fn default_dense_sigma() -> f32 {
    1.0
}

fn default_dtype() -> Dtype {
    Dtype::F32
}

fn default_batch_size() -> usize {
    1024
}

fn default_max_iterations() -> usize {
    100
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_patch_size() -> usize {
    5
}

fn default_keypoint_loss() -> RobustLoss {
    RobustLoss::Cauchy { scale: 0.25 }
}

fn default_max_displacement() -> f64 {
    8.0
}

fn default_association_radius() -> f64 {
    2.0
}

fn default_min_triangulation_angle_deg() -> f64 {
    1.5
}

fn default_bundle_loss() -> RobustLoss {
    RobustLoss::Cauchy { scale: 1.0 }
}

fn default_refine_poses() -> bool {
    true
}

fn default_num_fixed_images() -> usize {
    2
}

fn default_alternations() -> usize {
    1
}

fn default_num_matched() -> usize {
    5
}

fn default_pipeline_refiner() -> RefinerSettings {
    RefinerSettings {
        low_memory: true,
        dtype: Dtype::F16,
        ..RefinerSettings::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let settings: PipelineSettings = serde_json::from_str(r#"{"num_matched": 3}"#).unwrap();
        assert_eq!(settings.num_matched, 3);
        assert_eq!(settings.matcher, MatcherSettings::default());
        assert!(settings.refiner.low_memory);
        assert_eq!(settings.refiner.dtype, Dtype::F16);
    }

    #[test]
    fn tagged_strategies() {
        let settings: PipelineSettings = serde_json::from_str(
            r#"{
                "extractor": {"name": "fast_patch", "max_keypoints": 100},
                "matcher": {"scorer": {"name": "gaussian_l2", "sigma": 0.5}},
                "refiner": {"keypoint_loss": {"name": "huber", "scale": 0.1}, "dtype": "f32"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            settings.extractor,
            ExtractorSettings::FastPatch {
                threshold: 20,
                max_keypoints: 100,
                patch_size: 8
            }
        );
        assert_eq!(settings.matcher.scorer, ScorerSettings::GaussianL2 { sigma: 0.5 });
        assert_eq!(settings.refiner.keypoint_loss, RobustLoss::Huber { scale: 0.1 });
        assert_eq!(settings.refiner.dtype, Dtype::F32);
    }

    #[test]
    fn invalid_refiner_settings() {
        let mut settings = RefinerSettings::default();
        assert!(settings.validate().is_ok());
        settings.tolerance = 0.0;
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
        let settings = RefinerSettings {
            low_memory: true,
            ..RefinerSettings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
        assert!(RefinerSettings::low_memory("/tmp/dense").validate().is_ok());
    }

    #[test]
    fn zero_num_matched_is_rejected() {
        let settings = PipelineSettings {
            num_matched: 0,
            ..PipelineSettings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }
}
