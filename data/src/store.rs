use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::Array2;
use ndarray_npy::{ReadNpyError, read_npy};
use tracing::warn;

use crate::DataError;

/// Feature frames of one utterance: `[num_frames][dim]`.
pub type Frames = Vec<Vec<f32>>;

/// A loaded utterance and the path it was loaded from.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub path: PathBuf,
    pub frames: Frames,
}

impl Utterance {
    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Width of each frame, 0 for an empty utterance.
    pub fn dim(&self) -> usize {
        self.frames.first().map_or(0, Vec::len)
    }
}

/// Resolves sample paths to stored feature frames.
///
/// `load` must be idempotent and free of side effects: datasets rely on
/// being able to call it from several worker threads at once.
pub trait UtteranceStore: Send + Sync {
    /// Loads the frames stored at `path`.
    fn load(&self, path: &Path) -> Result<Frames, DataError>;

    /// Lists every sample below `root`, sorted.
    fn list(&self, root: &Path) -> Result<Vec<PathBuf>, DataError>;

    /// Native file extension of stored samples, without the dot.
    fn extension(&self) -> &str;
}

/// Reads `.npy` files holding 2-D `f32` arrays of shape `[frames, dim]`.
pub struct NpyStore {
    max_retries: usize,
}

impl NpyStore {
    pub const EXTENSION: &'static str = "npy";

    /// Creates a store that retries transient read errors twice.
    pub fn new() -> Self {
        Self { max_retries: 2 }
    }

    /// Creates a store with a custom bound on transient read retries.
    pub fn with_retries(max_retries: usize) -> Self {
        Self { max_retries }
    }
}

impl Default for NpyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceStore for NpyStore {
    fn load(&self, path: &Path) -> Result<Frames, DataError> {
        let array = read_with_retry(path, self.max_retries, || read_npy::<_, Array2<f32>>(path))?;
        frames_from_array(path, array)
    }

    fn list(&self, root: &Path) -> Result<Vec<PathBuf>, DataError> {
        let mut paths = Vec::new();
        walk(root, Self::EXTENSION, &mut paths)?;
        paths.sort();
        Ok(paths)
    }

    fn extension(&self) -> &str {
        Self::EXTENSION
    }
}

/// Runs `read` until it succeeds, retrying transient I/O errors at most
/// `max_retries` times. Any other error fails at once.
fn read_with_retry<T>(
    path: &Path,
    max_retries: usize,
    mut read: impl FnMut() -> Result<T, ReadNpyError>,
) -> Result<T, DataError> {
    let mut attempt = 0;
    loop {
        match read() {
            Ok(value) => return Ok(value),
            Err(ReadNpyError::Io(err)) if is_transient(&err) && attempt < max_retries => {
                attempt += 1;
                warn!(path = %path.display(), attempt, error = %err, "retrying sample read");
            }
            Err(err) => {
                return Err(DataError::StorageRead {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

fn frames_from_array(path: &Path, array: Array2<f32>) -> Result<Frames, DataError> {
    if array.ncols() == 0 {
        return Err(DataError::StorageRead {
            path: path.to_path_buf(),
            reason: "frames have zero width".into(),
        });
    }
    Ok(array.outer_iter().map(|row| row.to_vec()).collect())
}

fn walk(dir: &Path, ext: &str, paths: &mut Vec<PathBuf>) -> Result<(), DataError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DataError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| DataError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, ext, paths)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(ext) {
            paths.push(path);
        }
    }
    Ok(())
}

/// In-memory [`UtteranceStore`] that counts how often each path is loaded.
/// Suitable for testing.
pub struct MemoryStore {
    samples: BTreeMap<PathBuf, Frames>,
    extension: String,
    loads: AtomicUsize,
    per_path: Mutex<BTreeMap<PathBuf, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            samples: BTreeMap::new(),
            extension: NpyStore::EXTENSION.to_string(),
            loads: AtomicUsize::new(0),
            per_path: Mutex::new(BTreeMap::new()),
        }
    }

    /// Adds or replaces the sample stored at `path`.
    pub fn insert(&mut self, path: impl Into<PathBuf>, frames: Frames) {
        self.samples.insert(path.into(), frames);
    }

    /// Total number of successful and failed `load` calls.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of `load` calls made for `path`.
    pub fn load_count_for(&self, path: &Path) -> usize {
        let per_path = self.per_path.lock().unwrap_or_else(PoisonError::into_inner);
        per_path.get(path).copied().unwrap_or(0)
    }

    /// Total `load` calls made for paths below `root`.
    pub fn load_count_under(&self, root: &Path) -> usize {
        let per_path = self.per_path.lock().unwrap_or_else(PoisonError::into_inner);
        per_path
            .iter()
            .filter(|(p, _)| p.starts_with(root))
            .map(|(_, n)| n)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceStore for MemoryStore {
    fn load(&self, path: &Path) -> Result<Frames, DataError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        *self
            .per_path
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_path_buf())
            .or_insert(0) += 1;
        self.samples
            .get(path)
            .cloned()
            .ok_or_else(|| DataError::StorageRead {
                path: path.to_path_buf(),
                reason: "no such sample".into(),
            })
    }

    fn list(&self, root: &Path) -> Result<Vec<PathBuf>, DataError> {
        Ok(self
            .samples
            .keys()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect())
    }

    fn extension(&self) -> &str {
        &self.extension
    }
}
