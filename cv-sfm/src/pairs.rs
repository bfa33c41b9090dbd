//! Selection of the image pairs to match from the covisibility graph of a reference model.

use crate::{Error, ImageId, Reconstruction, Result};
use log::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// An unordered image pair with the smaller id first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Pair {
    pub a: ImageId,
    pub b: ImageId,
    /// Number of tracks observed in both images.
    pub score: usize,
}

impl Pair {
    pub fn new(a: ImageId, b: ImageId, score: usize) -> Self {
        Self {
            a: a.min(b),
            b: a.max(b),
            score,
        }
    }
}

/// For every image, selects the `num_matched` images sharing the most tracks with it.
///
/// Neighbors are ranked by descending shared track count, then by ascending id. The directed
/// selections are merged into undirected pairs, reported in the order they are first selected while
/// visiting images by ascending id.
pub fn select_covisible_pairs(reference: &Reconstruction, num_matched: usize) -> Result<Vec<Pair>> {
    if num_matched == 0 {
        return Err(Error::Config("num_matched must be at least 1".into()));
    }

    let mut image_tracks: BTreeMap<ImageId, BTreeSet<_>> = BTreeMap::new();
    for track in reference.tracks.values() {
        for element in &track.elements {
            image_tracks.entry(element.image).or_default().insert(track.id);
        }
    }
    if image_tracks.len() < 2 {
        return Err(Error::InsufficientData(format!(
            "{} images observe tracks, at least 2 are needed",
            image_tracks.len()
        )));
    }

    let mut seen = HashSet::new();
    let mut pairs = vec![];
    for (&image, tracks) in &image_tracks {
        let mut covisible: BTreeMap<ImageId, usize> = BTreeMap::new();
        for track in tracks {
            // Tracks are only indexed from images, so the lookup always succeeds.
            if let Some(track) = reference.tracks.get(track) {
                let images: BTreeSet<ImageId> =
                    track.elements.iter().map(|element| element.image).collect();
                for other in images.into_iter().filter(|&other| other != image) {
                    *covisible.entry(other).or_default() += 1;
                }
            }
        }
        let mut ranked: Vec<(ImageId, usize)> = covisible.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (other, score) in ranked.into_iter().take(num_matched) {
            let pair = Pair::new(image, other, score);
            if seen.insert((pair.a, pair.b)) {
                pairs.push(pair);
            }
        }
    }
    info!(
        "selected {} pairs from {} images with tracks",
        pairs.len(),
        image_tracks.len()
    );
    Ok(pairs)
}

/// Writes one `nameA nameB` line per pair.
pub fn write_pairs(path: impl AsRef<Path>, pairs: &[Pair], reconstruction: &Reconstruction) -> Result<()> {
    let path = path.as_ref();
    let mut text = String::new();
    for pair in pairs {
        let a = reconstruction.image(pair.a)?;
        let b = reconstruction.image(pair.b)?;
        let _ = writeln!(text, "{} {}", a.name, b.name);
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, text).map_err(|e| Error::io(path, e))
}

/// Reads the image name pairs written by [`write_pairs`].
pub fn read_pairs(path: impl AsRef<Path>) -> Result<Vec<(String, String)>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    text.lines()
        .enumerate()
        .map(|(ix, line)| (ix + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line, data)| {
            let names: Vec<&str> = data.split_whitespace().collect();
            match names.as_slice() {
                [a, b] => Ok((a.to_string(), b.to_string())),
                _ => Err(Error::parse(
                    path,
                    line,
                    format!("expected two image names, found {}", names.len()),
                )),
            }
        })
        .collect()
}

/// Resolves named pairs against a reconstruction. Pairs naming unknown images are skipped.
pub fn resolve_pairs(names: &[(String, String)], reconstruction: &Reconstruction) -> Vec<Pair> {
    names
        .iter()
        .filter_map(|(a, b)| {
            let a = reconstruction.image_by_name(a);
            let b = reconstruction.image_by_name(b);
            match (a, b) {
                (Some(a), Some(b)) if a.id != b.id => Some(Pair::new(a.id, b.id, 0)),
                _ => {
                    warn!("skipping pair of unknown images");
                    None
                }
            }
        })
        .collect()
}
