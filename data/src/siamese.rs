use rayon::prelude::*;

use crate::DataError;
use crate::collate::{Batch, Collator};
use crate::dataset::IdentityDataset;
use crate::sampler::IndexPair;
use crate::store::Utterance;

/// Two labeled utterances drawn as a training pair.
#[derive(Debug, Clone)]
pub struct SiamesePair {
    pub u1: Utterance,
    pub u2: Utterance,
    pub l1: u32,
    pub l2: u32,
}

impl SiamesePair {
    /// True when both utterances belong to the same speaker.
    pub fn is_same(&self) -> bool {
        self.l1 == self.l2
    }
}

/// Collated pair batch: `first[k]` and `second[k]` form pair `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct PairBatch {
    pub first: Batch,
    pub second: Batch,
}

impl PairBatch {
    pub fn len(&self) -> usize {
        self.first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty()
    }

    /// Same-speaker target of each pair.
    pub fn targets(&self) -> Vec<bool> {
        self.first
            .labels
            .iter()
            .zip(&self.second.labels)
            .map(|(a, b)| a == b)
            .collect()
    }
}

/// Turns index pairs from [`crate::ContrastiveSampler`] into utterance pairs.
pub struct Siamese<'a> {
    dataset: &'a IdentityDataset,
}

impl<'a> Siamese<'a> {
    pub fn new(dataset: &'a IdentityDataset) -> Self {
        Self { dataset }
    }

    pub fn get(&self, first: usize, second: usize) -> Result<SiamesePair, DataError> {
        let (u1, l1) = self.dataset.get(first)?;
        let (u2, l2) = self.dataset.get(second)?;
        Ok(SiamesePair { u1, u2, l1, l2 })
    }

    /// Loads a whole batch of pairs in parallel, in order.
    pub fn load_batch(&self, pairs: &[IndexPair]) -> Result<Vec<SiamesePair>, DataError> {
        pairs.par_iter().map(|&(a, b)| self.get(a, b)).collect()
    }
}

/// Collates both sides of a pair batch with the same collator.
pub fn collate_pairs(collator: &mut Collator, pairs: Vec<SiamesePair>) -> PairBatch {
    let (left, right): (Vec<_>, Vec<_>) = pairs
        .into_iter()
        .map(|p| ((p.u1.frames, p.l1), (p.u2.frames, p.l2)))
        .unzip();
    PairBatch {
        first: collator.collate_labeled(left),
        second: collator.collate_labeled(right),
    }
}
