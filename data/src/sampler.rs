use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::DataError;

/// A pair of dataset indices `(anchor, partner)`.
pub type IndexPair = (usize, usize);

/// Derives the seed of one epoch from a run seed, so that an epoch's
/// batches can be reproduced after a restart.
pub fn epoch_seed(seed: u64, epoch: u64) -> u64 {
    seed ^ epoch.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Draws batches of index pairs for contrastive training.
///
/// # Policy
///
/// - Every utterance is an anchor exactly once per epoch.
/// - Anchors are interleaved round-robin over speakers, with speaker order
///   and per-speaker order shuffled, so no speaker dominates a stretch of
///   batches.
/// - Anchors are cut into batches of `batch_size`; a trailing batch with a
///   single anchor is merged into the one before it.
/// - Within a batch the first `ceil(n / 2)` anchors are paired with an
///   utterance of the same speaker (itself if the speaker has one
///   utterance) and the rest with an utterance of another speaker.
///
/// So every batch holds at least one positive and one negative pair and
/// at least two distinct speakers.
#[derive(Debug, Clone)]
pub struct ContrastiveSampler {
    labels: Vec<u32>,
    by_speaker: BTreeMap<u32, Vec<usize>>,
    batch_size: usize,
    seed: u64,
}

impl ContrastiveSampler {
    pub fn new(
        labels: &[u32],
        num_speakers: usize,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, DataError> {
        if batch_size < 2 {
            return Err(DataError::Config(format!(
                "contrastive batch size must be at least 2, got {batch_size}"
            )));
        }
        let mut by_speaker: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            if label as usize >= num_speakers {
                return Err(DataError::Config(format!(
                    "label {label} at index {i} is outside [0, {num_speakers})"
                )));
            }
            by_speaker.entry(label).or_default().push(i);
        }
        if by_speaker.len() < 2 {
            return Err(DataError::Config(format!(
                "contrastive sampling needs at least 2 speakers, got {}",
                by_speaker.len()
            )));
        }
        Ok(Self {
            labels: labels.to_vec(),
            by_speaker,
            batch_size,
            seed,
        })
    }

    /// Batches for epoch `epoch`. The same sampler and epoch always give
    /// the same batches.
    pub fn epoch(&self, epoch: u64) -> Vec<Vec<IndexPair>> {
        self.draw(epoch_seed(self.seed, epoch))
    }

    /// Number of batches in every epoch.
    pub fn num_batches(&self) -> usize {
        let n = self.labels.len();
        let full = n / self.batch_size;
        match n % self.batch_size {
            0 => full,
            1 if full > 0 => full,
            _ => full + 1,
        }
    }

    fn draw(&self, seed: u64) -> Vec<Vec<IndexPair>> {
        let mut rng = StdRng::seed_from_u64(seed);

        let speakers: Vec<u32> = self.by_speaker.keys().copied().collect();
        let mut order = speakers.clone();
        order.shuffle(&mut rng);
        let mut pools: Vec<Vec<usize>> = order
            .iter()
            .map(|s| {
                let mut pool = self.by_speaker[s].clone();
                pool.shuffle(&mut rng);
                pool
            })
            .collect();

        let mut anchors = Vec::with_capacity(self.labels.len());
        let longest = pools.iter().map(Vec::len).max().unwrap_or(0);
        for round in 0..longest {
            for pool in &mut pools {
                if let Some(&i) = pool.get(round) {
                    anchors.push(i);
                }
            }
        }

        let mut chunks: Vec<Vec<usize>> = anchors
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        if chunks.len() > 1 && chunks.last().is_some_and(|c| c.len() < 2) {
            let tail = chunks.pop().unwrap_or_default();
            if let Some(prev) = chunks.last_mut() {
                prev.extend(tail);
            }
        }

        chunks
            .into_iter()
            .map(|chunk| {
                let positives = chunk.len().div_ceil(2);
                chunk
                    .iter()
                    .enumerate()
                    .map(|(k, &anchor)| {
                        let partner = if k < positives {
                            self.positive_for(anchor, &mut rng)
                        } else {
                            self.negative_for(anchor, &speakers, &mut rng)
                        };
                        (anchor, partner)
                    })
                    .collect()
            })
            .collect()
    }

    fn positive_for(&self, anchor: usize, rng: &mut StdRng) -> usize {
        let pool = &self.by_speaker[&self.labels[anchor]];
        if pool.len() < 2 {
            return anchor;
        }
        // Uniform over the pool without the anchor itself.
        let pos = pool.iter().position(|&i| i == anchor).unwrap_or(0);
        let mut k = rng.gen_range(0..pool.len() - 1);
        if k >= pos {
            k += 1;
        }
        pool[k]
    }

    fn negative_for(&self, anchor: usize, speakers: &[u32], rng: &mut StdRng) -> usize {
        let own = self.labels[anchor];
        let own_pos = speakers.iter().position(|&s| s == own).unwrap_or(0);
        let mut k = rng.gen_range(0..speakers.len() - 1);
        if k >= own_pos {
            k += 1;
        }
        let pool = &self.by_speaker[&speakers[k]];
        pool[rng.gen_range(0..pool.len())]
    }
}

/// Draws one epoch of contrastive index-pair batches.
pub fn sample_epoch(
    labels: &[u32],
    num_speakers: usize,
    batch_size: usize,
    seed: u64,
) -> Result<Vec<Vec<IndexPair>>, DataError> {
    Ok(ContrastiveSampler::new(labels, num_speakers, batch_size, seed)?.draw(seed))
}

/// Splits `0..len` into shuffled batches of `batch_size`; the last batch
/// may be shorter.
pub fn shuffled_batches(len: usize, batch_size: usize, seed: u64) -> Result<Vec<Vec<usize>>, DataError> {
    if batch_size == 0 {
        return Err(DataError::Config("batch size must be positive".into()));
    }
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    Ok(order.chunks(batch_size).map(<[usize]>::to_vec).collect())
}
