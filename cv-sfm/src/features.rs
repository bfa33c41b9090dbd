use crate::{Error, ExtractorSettings, FeatureStore, Result};
use cv_core::KeyPoint;
use float_ord::FloatOrd;
use image::{DynamicImage, GrayImage};
use log::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use rstar::RTree;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "ppm", "pgm"];

/// Detected corners closer than this to a seed keypoint are dropped as duplicates.
const SEED_EXCLUSION_RADIUS: f64 = 1.5;

/// The sparse features of one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Vec<f32>>,
    /// Detector response of each keypoint. Seed keypoints score `0.0`.
    pub scores: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Detects and describes sparse features in an image.
pub trait FeatureExtractor {
    /// Extracts features whose first keypoints are `seeds`, in order, followed by the detected
    /// ones.
    fn extract_seeded(&self, image: &DynamicImage, seeds: &[KeyPoint]) -> FeatureSet;

    fn extract(&self, image: &DynamicImage) -> FeatureSet {
        self.extract_seeded(image, &[])
    }
}

/// FAST-9 corners described by their intensity patch, normalized to zero mean and unit length.
///
/// Corners are ordered by descending score and only the best `max_keypoints` are kept. Corners
/// whose patch leaves the image or has no texture are skipped. Seed keypoints are always kept; a
/// seed without a usable patch gets a zero descriptor, which never matches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FastPatchExtractor {
    pub threshold: u8,
    pub max_keypoints: usize,
    pub patch_size: usize,
}

impl Default for FastPatchExtractor {
    fn default() -> Self {
        Self {
            threshold: 20,
            max_keypoints: 4096,
            patch_size: 8,
        }
    }
}

impl FastPatchExtractor {
    pub fn from_settings(settings: ExtractorSettings) -> Self {
        match settings {
            ExtractorSettings::FastPatch {
                threshold,
                max_keypoints,
                patch_size,
            } => Self {
                threshold,
                max_keypoints,
                patch_size,
            },
        }
    }

    fn describe(&self, image: &GrayImage, x: u32, y: u32) -> Option<Vec<f32>> {
        let half = (self.patch_size / 2) as i64;
        let left = x as i64 - half;
        let top = y as i64 - half;
        let size = self.patch_size as i64;
        if left < 0
            || top < 0
            || left + size > image.width() as i64
            || top + size > image.height() as i64
        {
            return None;
        }
        let mut patch: Vec<f32> = (top..top + size)
            .flat_map(|y| (left..left + size).map(move |x| (x, y)))
            .map(|(x, y)| image.get_pixel(x as u32, y as u32)[0] as f32)
            .collect();
        let mean = patch.iter().sum::<f32>() / patch.len() as f32;
        patch.iter_mut().for_each(|v| *v -= mean);
        let norm = patch.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-6 {
            return None;
        }
        patch.iter_mut().for_each(|v| *v /= norm);
        Some(patch)
    }

    /// The descriptor of the pixel containing a subpixel keypoint.
    fn describe_keypoint(&self, image: &GrayImage, keypoint: KeyPoint) -> Option<Vec<f32>> {
        let x = keypoint.x.floor();
        let y = keypoint.y.floor();
        if !(x >= 0.0 && y >= 0.0 && x < image.width() as f64 && y < image.height() as f64) {
            return None;
        }
        self.describe(image, x as u32, y as u32)
    }
}

impl FeatureExtractor for FastPatchExtractor {
    fn extract_seeded(&self, image: &DynamicImage, seeds: &[KeyPoint]) -> FeatureSet {
        let gray = image.to_luma8();
        let mut features = FeatureSet {
            width: gray.width(),
            height: gray.height(),
            ..FeatureSet::default()
        };
        for &seed in seeds {
            let descriptor = self
                .describe_keypoint(&gray, seed)
                .unwrap_or_else(|| vec![0.0; self.patch_size * self.patch_size]);
            features.keypoints.push(seed);
            features.descriptors.push(descriptor);
            features.scores.push(0.0);
        }
        let occupied: RTree<[f64; 2]> =
            RTree::bulk_load(seeds.iter().map(|seed| [seed.x, seed.y]).collect());

        let mut corners = imageproc::corners::corners_fast9(&gray, self.threshold);
        corners.sort_by_key(|corner| (std::cmp::Reverse(FloatOrd(corner.score)), corner.y, corner.x));
        let mut detected = 0;
        for corner in corners {
            if detected == self.max_keypoints {
                break;
            }
            // Pixel centers sit at half-integer coordinates.
            let location = [corner.x as f64 + 0.5, corner.y as f64 + 0.5];
            if occupied
                .locate_within_distance(location, SEED_EXCLUSION_RADIUS * SEED_EXCLUSION_RADIUS)
                .next()
                .is_some()
            {
                continue;
            }
            if let Some(descriptor) = self.describe(&gray, corner.x, corner.y) {
                features.keypoints.push(KeyPoint::new(location[0], location[1]));
                features.descriptors.push(descriptor);
                features.scores.push(corner.score);
                detected += 1;
            }
        }
        trace!("extracted {} features ({} seeds)", features.len(), seeds.len());
        features
    }
}

/// Lists the images under `dir` recursively, as sorted paths relative to `dir` using `/`.
pub fn list_images(dir: impl AsRef<Path>) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    let mut names = vec![];
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let current = dir.join(&relative);
        let entries = fs::read_dir(&current).map_err(|e| Error::io(&current, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&current, e))?;
            let path = entry.path();
            let relative = relative.join(entry.file_name());
            if path.is_dir() {
                pending.push(relative);
            } else if is_image(&path) {
                let name = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| IMAGE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Extracts features of the named images into the store.
///
/// The keypoints listed in `seeds` for an image come first in its feature set, in order. Images
/// already in the store are skipped unless `overwrite` is set. Returns the number of images that
/// were extracted.
pub fn extract_features<E>(
    extractor: &E,
    images_dir: impl AsRef<Path>,
    names: &[String],
    seeds: &HashMap<String, Vec<KeyPoint>>,
    store: &FeatureStore,
    overwrite: bool,
) -> Result<usize>
where
    E: FeatureExtractor + Sync,
{
    let images_dir = images_dir.as_ref();
    let todo: Vec<&String> = names
        .iter()
        .filter(|name| overwrite || !store.contains(name))
        .collect();
    info!(
        "extracting features of {} images ({} already present)",
        todo.len(),
        names.len() - todo.len()
    );
    let extracted = todo
        .par_iter()
        .map(|&name| -> Result<_> {
            let image = image::open(images_dir.join(name))?;
            let features = match seeds.get(name.as_str()) {
                Some(seeds) => extractor.extract_seeded(&image, seeds),
                None => extractor.extract(&image),
            };
            debug!("{}: {} features", name, features.len());
            Ok((name.clone(), features))
        })
        .collect::<Result<Vec<_>>>()?;
    let count = extracted.len();
    for (name, features) in extracted {
        store.put(name, features);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn squares() -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(64, 64, |x, y| {
            if (x / 16 + y / 16) % 2 == 0 {
                Luma([220u8])
            } else {
                Luma([30u8])
            }
        }))
    }

    #[test]
    fn extraction_is_bounded_and_normalized() {
        let extractor = FastPatchExtractor {
            max_keypoints: 5,
            ..FastPatchExtractor::default()
        };
        let features = extractor.extract(&squares());
        assert!(features.len() <= 5);
        assert_eq!(features.descriptors.len(), features.len());
        for descriptor in &features.descriptors {
            let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
        assert!(features
            .scores
            .windows(2)
            .all(|pair| pair[0] >= pair[1]));
    }

    fn bright_square() -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(64, 64, |x, y| {
            if (20..44).contains(&x) && (20..44).contains(&y) {
                Luma([220u8])
            } else {
                Luma([30u8])
            }
        }))
    }

    #[test]
    fn seeds_lead_in_order() {
        let extractor = FastPatchExtractor::default();
        let image = bright_square();
        let corner = extractor.extract(&image).keypoints[0];
        let seeds = vec![
            KeyPoint::new(corner.x + 0.3, corner.y - 0.2),
            KeyPoint::new(-4.0, 10.0),
            KeyPoint::new(8.5, 8.5),
        ];
        let features = extractor.extract_seeded(&image, &seeds);
        assert_eq!(&features.keypoints[..3], &seeds[..]);
        assert_eq!(features.descriptors.len(), features.len());
        assert_eq!(features.scores[..3], [0.0; 3]);
        // The seed off the image cannot be described.
        assert!(features.descriptors[1].iter().all(|&v| v == 0.0));
        assert!(features.descriptors[0].iter().any(|&v| v != 0.0));
        // The detected corner under the first seed is not repeated.
        assert!(features.keypoints[3..]
            .iter()
            .all(|k| (k.0 - seeds[0].0).norm() > SEED_EXCLUSION_RADIUS));
    }

    #[test]
    fn flat_image_has_no_features() {
        let image = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(32, 32, Luma([128u8])));
        assert!(FastPatchExtractor::default().extract(&image).is_empty());
    }
}
