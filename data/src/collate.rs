//! Per-utterance centering, clip policies and padding.
//!
//! Evaluation keeps the first `max_size` frames and must stay
//! deterministic for a given model; training takes a random window.
//! Neither policy pads: padding is done separately by
//! [`PaddedBatch::pad`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::DataError;
use crate::store::Frames;

/// Subtracts the per-dimension mean over time from every frame.
pub fn center(frames: &mut Frames) {
    let Some(dim) = frames.first().map(Vec::len) else {
        return;
    };
    let mut mean = vec![0.0f64; dim];
    for frame in frames.iter() {
        for (m, &v) in mean.iter_mut().zip(frame) {
            *m += v as f64;
        }
    }
    let n = frames.len() as f64;
    for m in &mut mean {
        *m /= n;
    }
    for frame in frames.iter_mut() {
        for (v, &m) in frame.iter_mut().zip(&mean) {
            *v = (*v as f64 - m) as f32;
        }
    }
}

/// Keeps the first `max_size` frames.
pub fn clip_top(mut frames: Frames, max_size: usize) -> Frames {
    frames.truncate(max_size);
    frames
}

/// Keeps a window of `max_size` frames starting at a uniformly random
/// offset in `[0, len - max_size]`.
pub fn clip_random<R: Rng + ?Sized>(frames: Frames, max_size: usize, rng: &mut R) -> Frames {
    if frames.len() <= max_size {
        return frames;
    }
    let start = rng.gen_range(0..=frames.len() - max_size);
    frames.into_iter().skip(start).take(max_size).collect()
}

/// A batch of centered, clipped sequences and their labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub sequences: Vec<Frames>,
    pub labels: Vec<u32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Centers and clips sequences for a batch.
pub enum Collator {
    /// Deterministic: keeps the first `max_size` frames.
    Evaluation { max_size: usize },
    /// Stochastic: keeps a random `max_size` window.
    Training { max_size: usize, rng: StdRng },
}

impl Collator {
    pub fn evaluation(max_size: usize) -> Self {
        Self::Evaluation { max_size }
    }

    pub fn training(max_size: usize, seed: u64) -> Self {
        Self::Training {
            max_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn max_size(&self) -> usize {
        match self {
            Self::Evaluation { max_size } | Self::Training { max_size, .. } => *max_size,
        }
    }

    /// Centers then clips one sequence.
    pub fn apply(&mut self, mut frames: Frames) -> Frames {
        center(&mut frames);
        match self {
            Self::Evaluation { max_size } => clip_top(frames, *max_size),
            Self::Training { max_size, rng } => clip_random(frames, *max_size, rng),
        }
    }

    /// Collates unlabeled sequences (verification scoring).
    pub fn collate(&mut self, sequences: Vec<Frames>) -> Vec<Frames> {
        sequences.into_iter().map(|s| self.apply(s)).collect()
    }

    /// Collates labeled sequences.
    pub fn collate_labeled(&mut self, items: Vec<(Frames, u32)>) -> Batch {
        let (sequences, labels): (Vec<Frames>, Vec<u32>) = items.into_iter().unzip();
        Batch {
            sequences: self.collate(sequences),
            labels,
        }
    }
}

/// How [`PaddedBatch::pad`] fills frames past the end of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadMode {
    /// Zero frames.
    #[default]
    Zeros,
    /// Repeat the sequence from its start.
    Wrap,
}

/// Fixed-shape batch `[batch][max_len][dim]`, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedBatch {
    pub data: Vec<f32>,
    /// Unpadded length of each sequence.
    pub lengths: Vec<usize>,
    pub max_len: usize,
    pub dim: usize,
}

impl PaddedBatch {
    /// Pads sequences to the longest one. All frames must share a width.
    pub fn pad(sequences: &[Frames], mode: PadMode) -> Result<Self, DataError> {
        let dim = sequences
            .iter()
            .find_map(|s| s.first().map(Vec::len))
            .unwrap_or(0);
        let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = vec![0.0f32; sequences.len() * max_len * dim];

        for (b, seq) in sequences.iter().enumerate() {
            for (t, frame) in seq.iter().enumerate() {
                if frame.len() != dim {
                    return Err(DataError::DimensionMismatch {
                        expected: dim,
                        got: frame.len(),
                    });
                }
                let off = (b * max_len + t) * dim;
                data[off..off + dim].copy_from_slice(frame);
            }
            if mode == PadMode::Wrap && !seq.is_empty() {
                for t in seq.len()..max_len {
                    let off = (b * max_len + t) * dim;
                    data[off..off + dim].copy_from_slice(&seq[t % seq.len()]);
                }
            }
        }

        Ok(Self {
            data,
            lengths: sequences.iter().map(Vec::len).collect(),
            max_len,
            dim,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Frame `t` of sequence `b`, including padding frames.
    pub fn frame(&self, b: usize, t: usize) -> &[f32] {
        let off = (b * self.max_len + t) * self.dim;
        &self.data[off..off + self.dim]
    }

    /// Concatenates two batches of the same width along the batch axis.
    pub fn concat(&self, other: &PaddedBatch) -> Result<Self, DataError> {
        if self.batch_size() > 0 && other.batch_size() > 0 && self.dim != other.dim {
            return Err(DataError::DimensionMismatch {
                expected: self.dim,
                got: other.dim,
            });
        }
        let dim = self.dim.max(other.dim);
        let max_len = self.max_len.max(other.max_len);
        let mut data = vec![0.0f32; (self.batch_size() + other.batch_size()) * max_len * dim];
        let mut row = 0;
        for part in [self, other] {
            for b in 0..part.batch_size() {
                for t in 0..part.max_len {
                    let off = (row * max_len + t) * dim;
                    data[off..off + dim].copy_from_slice(part.frame(b, t));
                }
                row += 1;
            }
        }
        let mut lengths = self.lengths.clone();
        lengths.extend_from_slice(&other.lengths);
        Ok(Self {
            data,
            lengths,
            max_len,
            dim,
        })
    }
}
