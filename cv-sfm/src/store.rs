//! Persistent key-value stores for the intermediate results of the pipeline.
//!
//! Each store is a single bincode file holding a format version and the entries in insertion order.
//! Writers share the store through a lock, and [`KeyValueStore::flush`] replaces the file atomically
//! so a crash never leaves a half-written store behind.

use crate::{read_text_model, write_text_model, Correspondences, Error, FeatureSet, Reconstruction, Result};
use log::*;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::Hash;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoreFile<K, V> {
    version: u32,
    entries: Vec<(K, V)>,
}

struct Entries<K, V> {
    entries: Vec<(K, V)>,
    index: HashMap<K, usize>,
}

impl<K, V> Default for Entries<K, V> {
    fn default() -> Self {
        Self {
            entries: vec![],
            index: HashMap::new(),
        }
    }
}

/// An insertion ordered map that can be shared between threads and persisted to disk.
pub struct KeyValueStore<K, V> {
    path: Option<PathBuf>,
    entries: RwLock<Entries<K, V>>,
}

impl<K, V> KeyValueStore<K, V>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// A store that is never written to disk. [`KeyValueStore::flush`] does nothing.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Opens the store backed by `path`, loading its entries if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = Entries::default();
        if path.exists() {
            let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
            let stored: StoreFile<K, V> = bincode::deserialize_from(BufReader::new(file))?;
            if stored.version != STORE_VERSION {
                return Err(Error::parse(
                    &path,
                    0,
                    format!("unsupported store version {}", stored.version),
                ));
            }
            for (key, value) in stored.entries {
                entries.insert(key, value);
            }
            info!("loaded {} entries from {}", entries.entries.len(), path.display());
        } else {
            debug!("creating new store at {}", path.display());
        }
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &K) -> Result<V> {
        let entries = self.entries.read();
        entries
            .index
            .get(key)
            .map(|&ix| entries.entries[ix].1.clone())
            .ok_or_else(|| Error::NotFound(format!("{:?}", key)))
    }

    /// Inserts or replaces an entry. A replaced entry keeps its position.
    pub fn put(&self, key: K, value: V) {
        self.entries.write().insert(key, value);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries
            .read()
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// A snapshot of all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> {
        self.entries.read().entries.clone().into_iter()
    }

    /// Writes the store to its file by way of a temporary file in the same directory.
    pub fn flush(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut temporary = path.clone().into_os_string();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);

        let entries = self.entries.read();
        // Same layout as `StoreFile`, without cloning the entries.
        let stored = (STORE_VERSION, &entries.entries);
        let file = File::create(&temporary).map_err(|e| Error::io(&temporary, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &stored)?;
        writer
            .into_inner()
            .map_err(|e| Error::io(&temporary, e.into_error()))?
            .sync_all()
            .map_err(|e| Error::io(&temporary, e))?;
        fs::rename(&temporary, path).map_err(|e| Error::io(path, e))?;
        debug!("flushed {} entries to {}", entries.entries.len(), path.display());
        Ok(())
    }
}

impl<K, V> Entries<K, V>
where
    K: Clone + Eq + Hash,
{
    fn insert(&mut self, key: K, value: V) {
        match self.index.get(&key) {
            Some(&ix) => self.entries[ix].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }
}

/// Sparse features keyed by image name.
pub type FeatureStore = KeyValueStore<String, FeatureSet>;

/// An image pair keyed by name, with the names in lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey(pub String, pub String);

impl PairKey {
    /// The canonical key of a pair and whether `a` and `b` were swapped to produce it.
    pub fn new(a: &str, b: &str) -> (Self, bool) {
        if a <= b {
            (Self(a.to_owned(), b.to_owned()), false)
        } else {
            (Self(b.to_owned(), a.to_owned()), true)
        }
    }
}

/// Correspondences between image pairs.
///
/// Callers always address a pair as `(a, b)` and see matches oriented from `a` to `b`, whichever
/// order the pair was stored in.
pub struct MatchStore {
    store: KeyValueStore<PairKey, Correspondences>,
}

impl MatchStore {
    pub fn in_memory() -> Self {
        Self {
            store: KeyValueStore::in_memory(),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: KeyValueStore::open(path)?,
        })
    }

    pub fn get(&self, a: &str, b: &str) -> Result<Correspondences> {
        let (key, swapped) = PairKey::new(a, b);
        let correspondences = self.store.get(&key)?;
        Ok(if swapped {
            correspondences.swapped()
        } else {
            correspondences
        })
    }

    pub fn put(&self, a: &str, b: &str, correspondences: Correspondences) {
        let (key, swapped) = PairKey::new(a, b);
        let correspondences = if swapped {
            correspondences.swapped()
        } else {
            correspondences
        };
        self.store.put(key, correspondences);
    }

    pub fn contains(&self, a: &str, b: &str) -> bool {
        self.store.contains(&PairKey::new(a, b).0)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn keys(&self) -> Vec<PairKey> {
        self.store.keys()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

/// A COLMAP text model on disk.
#[derive(Debug, Clone)]
pub struct ReconstructionStore {
    dir: PathBuf,
}

impl ReconstructionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A model is present when all three of its files are.
    pub fn exists(&self) -> bool {
        [crate::CAMERAS_FILE, crate::IMAGES_FILE, crate::POINTS_FILE]
            .iter()
            .all(|file| self.dir.join(file).is_file())
    }

    pub fn read(&self) -> Result<Reconstruction> {
        read_text_model(&self.dir)
    }

    pub fn write(&self, reconstruction: &Reconstruction) -> Result<()> {
        write_text_model(&self.dir, reconstruction)
    }
}
