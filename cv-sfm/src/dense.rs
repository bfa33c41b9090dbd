//! Dense feature maps sampled by keypoint adjustment, and their cache.

use crate::bicubic::interpolate_bicubic;
use crate::{DenseSettings, Dtype, Error, Result};
use cv_core::nalgebra::Point2;
use cv_optimize::FeatureInterpolator;
use half::f16;
use image::DynamicImage;
use log::*;
use ndarray::{Array3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum FeatureData {
    F32(Array3<f32>),
    F16(Array3<f16>),
}

/// A multi-channel map with the shape `(channels, height, width)`.
///
/// Samples are at pixel centers, so in keypoint coordinates the sample `(x, y)` lies at
/// `(x + 0.5, y + 0.5)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMap {
    data: FeatureData,
}

impl FeatureMap {
    pub fn new(data: Array3<f32>) -> Self {
        Self {
            data: FeatureData::F32(data),
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self.data {
            FeatureData::F32(_) => Dtype::F32,
            FeatureData::F16(_) => Dtype::F16,
        }
    }

    /// Converts the storage precision.
    #[must_use]
    pub fn with_dtype(self, dtype: Dtype) -> Self {
        let data = match (self.data, dtype) {
            (FeatureData::F32(data), Dtype::F16) => FeatureData::F16(data.mapv(f16::from_f32)),
            (FeatureData::F16(data), Dtype::F32) => FeatureData::F32(data.mapv(f16::to_f32)),
            (data, _) => data,
        };
        Self { data }
    }

    fn dim(&self) -> (usize, usize, usize) {
        match &self.data {
            FeatureData::F32(data) => data.dim(),
            FeatureData::F16(data) => data.dim(),
        }
    }

    pub fn width(&self) -> usize {
        self.dim().2
    }

    pub fn height(&self) -> usize {
        self.dim().1
    }

    /// The sample of `channel` at column `x` and row `y`.
    #[inline]
    pub fn value(&self, channel: usize, x: usize, y: usize) -> f64 {
        match &self.data {
            FeatureData::F32(data) => data[[channel, y, x]] as f64,
            FeatureData::F16(data) => data[[channel, y, x]].to_f64(),
        }
    }
}

impl FeatureInterpolator for FeatureMap {
    fn channels(&self) -> usize {
        self.dim().0
    }

    fn interpolate(
        &self,
        point: Point2<f64>,
        values: &mut [f64],
        dx: &mut [f64],
        dy: &mut [f64],
    ) -> bool {
        let (channels, height, width) = self.dim();
        let (x, y) = (point.x - 0.5, point.y - 0.5);
        let mut samples = Vec::with_capacity(channels);
        for channel in 0..channels {
            match interpolate_bicubic(width, height, x, y, |x, y| self.value(channel, x, y)) {
                Some(sample) => samples.push(sample),
                None => return false,
            }
        }
        for (channel, (value, sample_dx, sample_dy)) in samples.into_iter().enumerate() {
            values[channel] = value;
            dx[channel] = sample_dx;
            dy[channel] = sample_dy;
        }
        true
    }
}

/// Computes a dense feature map of an image.
pub trait DenseExtractor {
    /// Names the extractor and its settings in the files of a [`DenseFeatureCache`].
    fn cache_key(&self) -> String;

    fn extract(&self, image: &DynamicImage) -> FeatureMap;
}

/// Three channels: the blurred intensity in `[0, 1]` and its horizontal and vertical Sobel
/// gradients per pixel.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GradientDenseExtractor {
    pub sigma: f32,
}

impl GradientDenseExtractor {
    pub fn from_settings(settings: DenseSettings) -> Self {
        match settings {
            DenseSettings::Gradient { sigma } => Self { sigma },
        }
    }
}

impl DenseExtractor for GradientDenseExtractor {
    fn cache_key(&self) -> String {
        format!("gradient-{}", self.sigma)
    }

    fn extract(&self, image: &DynamicImage) -> FeatureMap {
        let mut gray = image.to_luma16();
        if self.sigma > 0.0 {
            gray = imageproc::filter::gaussian_blur_f32(&gray, self.sigma);
        }
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        let mut data = Array3::<f32>::zeros((3, height, width));
        for (x, y, pixel) in gray.enumerate_pixels() {
            data[[0, y as usize, x as usize]] = pixel[0] as f32 / u16::MAX as f32;
        }

        let intensity = data.index_axis(Axis(0), 0).to_owned();
        let at = |x: isize, y: isize| {
            let x = x.clamp(0, width as isize - 1) as usize;
            let y = y.clamp(0, height as isize - 1) as usize;
            intensity[[y, x]]
        };
        for y in 0..height as isize {
            for x in 0..width as isize {
                let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
                let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
                data[[1, y as usize, x as usize]] = gx / 8.0;
                data[[2, y as usize, x as usize]] = gy / 8.0;
            }
        }
        FeatureMap::new(data)
    }
}

/// Dense maps of the images of a reconstruction.
///
/// Maps are either resident in memory or, in low-memory mode, written to `dir` and read back each
/// time they are loaded. Files are named after the image, the extractor settings and the storage
/// precision, so maps computed with other settings are never reused.
pub struct DenseFeatureCache {
    dir: Option<PathBuf>,
    low_memory: bool,
    /// File name suffix of the maps computed by the last [`DenseFeatureCache::prepare`].
    suffix: String,
    resident: HashMap<String, Arc<FeatureMap>>,
}

impl DenseFeatureCache {
    /// Keeps every map in memory, also writing them to `dir` if one is given.
    pub fn in_memory(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            low_memory: false,
            suffix: String::new(),
            resident: HashMap::new(),
        }
    }

    /// Only keeps maps on disk under `dir`.
    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            low_memory: true,
            suffix: String::new(),
            resident: HashMap::new(),
        }
    }

    fn path(dir: &Path, name: &str, suffix: &str) -> PathBuf {
        dir.join(format!("{}.{}", name, suffix))
    }

    /// Computes the maps of the named images.
    ///
    /// With `use_cache`, maps already present in the cache directory are reused. Returns the number
    /// of maps that were computed.
    pub fn prepare<E>(
        &mut self,
        extractor: &E,
        images_dir: &Path,
        names: &[String],
        dtype: Dtype,
        use_cache: bool,
    ) -> Result<usize>
    where
        E: DenseExtractor + Sync,
    {
        let precision = match dtype {
            Dtype::F32 => "f32",
            Dtype::F16 => "f16",
        };
        self.suffix = format!("{}.{}.dense", extractor.cache_key(), precision);
        let suffix = self.suffix.as_str();
        let dir = self.dir.as_deref();
        let low_memory = self.low_memory;
        let prepared = names
            .par_iter()
            .map(|name| -> Result<_> {
                if let Some(dir) = dir.filter(|_| use_cache) {
                    let path = Self::path(dir, name, suffix);
                    if path.is_file() {
                        trace!("reusing dense map of {}", name);
                        let map = if low_memory {
                            None
                        } else {
                            Some(Arc::new(read_map(&path)?.with_dtype(dtype)))
                        };
                        return Ok((name, map, false));
                    }
                }
                let image = image::open(images_dir.join(name))?;
                let map = extractor.extract(&image).with_dtype(dtype);
                if let Some(dir) = dir {
                    write_map(&Self::path(dir, name, suffix), &map)?;
                }
                let map = if low_memory { None } else { Some(Arc::new(map)) };
                Ok((name, map, true))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut computed = 0;
        for (name, map, fresh) in prepared {
            if fresh {
                computed += 1;
            }
            if let Some(map) = map {
                self.resident.insert(name.clone(), map);
            }
        }
        info!(
            "prepared dense maps of {} images ({} computed)",
            names.len(),
            computed
        );
        Ok(computed)
    }

    /// Loads the maps of the named images.
    pub fn load(&self, names: &[String]) -> Result<HashMap<String, Arc<FeatureMap>>> {
        if !self.low_memory {
            return names
                .iter()
                .map(|name| {
                    self.resident
                        .get(name)
                        .map(|map| (name.clone(), map.clone()))
                        .ok_or_else(|| Error::NotFound(format!("dense map of {}", name)))
                })
                .collect();
        }
        let dir = self
            .dir
            .as_deref()
            .ok_or_else(|| Error::Config("low-memory dense cache without a directory".into()))?;
        names
            .par_iter()
            .map(|name| -> Result<_> {
                let path = Self::path(dir, name, &self.suffix);
                Ok((name.clone(), Arc::new(read_map(&path)?)))
            })
            .collect()
    }
}

fn read_map(path: &Path) -> Result<FeatureMap> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(bincode::deserialize_from(BufReader::new(file))?)
}

/// Writes next to `path` first, so an interrupted write never leaves a partial map behind.
fn write_map(path: &Path, map: &FeatureMap) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let mut temporary = path.as_os_str().to_owned();
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);
    let file = File::create(&temporary).map_err(|e| Error::io(&temporary, e))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, map)?;
    writer
        .into_inner()
        .map_err(|e| Error::io(&temporary, e.into_error()))?
        .sync_all()
        .map_err(|e| Error::io(&temporary, e))?;
    fs::rename(&temporary, path).map_err(|e| Error::io(path, e))?;
    Ok(())
}
