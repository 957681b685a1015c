use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::info;

use crate::DataError;
use crate::loader::load_all;
use crate::speaker::{SpeakerPattern, SpeakerSet};
use crate::store::{Frames, Utterance, UtteranceStore};

/// An indexable sequence of utterances.
///
/// Implemented by [`IdentityDataset`] and by each side of a trial list
/// ([`crate::TrialSet`]), so the collator, loader and evaluator can work
/// on either.
pub trait FeatureSet: Send + Sync {
    /// Number of loadable utterances.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Source path of the `index`-th utterance.
    fn path(&self, index: usize) -> Result<&Path, DataError>;

    /// Loads the `index`-th utterance.
    fn load(&self, index: usize) -> Result<Utterance, DataError>;
}

/// Controls how an [`IdentityDataset`] is built.
#[derive(Debug, Clone, Default)]
pub struct DatasetOptions {
    /// Speaker id extraction pattern and base offset.
    pub pattern: SpeakerPattern,
    /// Load every sample into memory at construction time.
    pub preload: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    label: u32,
    /// Position in the preload table.
    slot: usize,
}

/// Utterances with dense speaker labels, restricted to a speaker set.
///
/// Cloning is cheap for preloaded datasets: the frame table is shared.
#[derive(Clone)]
pub struct IdentityDataset {
    root: PathBuf,
    store: Arc<dyn UtteranceStore>,
    entries: Vec<Entry>,
    preloaded: Option<Arc<Vec<Frames>>>,
    num_speakers: usize,
}

impl IdentityDataset {
    /// Indexes every sample under `root` whose speaker is in `speakers`.
    ///
    /// Every sample path must carry a speaker id; a path without one is a
    /// configuration error rather than a skipped sample.
    pub fn build(
        root: &Path,
        speakers: &SpeakerSet,
        store: Arc<dyn UtteranceStore>,
        opts: &DatasetOptions,
    ) -> Result<Self, DataError> {
        let mut entries = Vec::new();
        for path in store.list(root)? {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let raw = opts.pattern.speaker_of(rel)?;
            if let Some(label) = speakers.label_of(raw) {
                let slot = entries.len();
                entries.push(Entry { path, label, slot });
            }
        }
        if entries.is_empty() {
            return Err(DataError::EmptyDataset {
                root: root.to_path_buf(),
            });
        }

        let preloaded = if opts.preload {
            let paths: Vec<PathBuf> = entries.iter().map(|e| e.path.clone()).collect();
            let frames = load_all(store.as_ref(), &paths)?;
            Some(Arc::new(frames))
        } else {
            None
        };

        info!(
            root = %root.display(),
            samples = entries.len(),
            speakers = speakers.len(),
            preload = opts.preload,
            "identity dataset built"
        );

        Ok(Self {
            root: root.to_path_buf(),
            store,
            entries,
            preloaded,
            num_speakers: speakers.len(),
        })
    }

    /// Splits into two disjoint datasets of `floor(ratio * len)` and the
    /// remaining samples. With `shuffle_seed`, samples are permuted first;
    /// the same seed always gives the same split.
    pub fn split(&self, ratio: f64, shuffle_seed: Option<u64>) -> Result<(Self, Self), DataError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(DataError::Config(format!(
                "split ratio must be within [0, 1], got {ratio}"
            )));
        }
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        if let Some(seed) = shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        let split_point = (ratio * self.entries.len() as f64).floor() as usize;

        let pick = |idx: &[usize]| Self {
            root: self.root.clone(),
            store: Arc::clone(&self.store),
            entries: idx.iter().map(|&i| self.entries[i].clone()).collect(),
            preloaded: self.preloaded.clone(),
            num_speakers: self.num_speakers,
        };
        Ok((pick(&order[..split_point]), pick(&order[split_point..])))
    }

    /// Returns the `index`-th utterance and its label.
    pub fn get(&self, index: usize) -> Result<(Utterance, u32), DataError> {
        let entry = self.entry(index)?;
        let frames = match &self.preloaded {
            Some(table) => table[entry.slot].clone(),
            None => self.store.load(&entry.path)?,
        };
        Ok((
            Utterance {
                path: entry.path.clone(),
                frames,
            },
            entry.label,
        ))
    }

    pub fn label(&self, index: usize) -> Result<u32, DataError> {
        self.entry(index).map(|e| e.label)
    }

    fn entry(&self, index: usize) -> Result<&Entry, DataError> {
        self.entries.get(index).ok_or(DataError::IndexOutOfRange {
            index,
            len: self.entries.len(),
        })
    }

    /// Labels in dataset order.
    pub fn labels(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.label).collect()
    }

    /// Sample paths in dataset order.
    pub fn paths(&self) -> Vec<&Path> {
        self.entries.iter().map(|e| e.path.as_path()).collect()
    }

    /// Size of the speaker set the dataset was built for.
    pub fn num_speakers(&self) -> usize {
        self.num_speakers
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_preloaded(&self) -> bool {
        self.preloaded.is_some()
    }
}

impl FeatureSet for IdentityDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn path(&self, index: usize) -> Result<&Path, DataError> {
        self.entry(index).map(|e| e.path.as_path())
    }

    fn load(&self, index: usize) -> Result<Utterance, DataError> {
        self.get(index).map(|(u, _)| u)
    }
}
