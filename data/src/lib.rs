//! Data side of speaker verification training.
//!
//! # Pipeline
//!
//! 1. [`UtteranceStore`]: sample path -> feature frames
//! 2. [`IdentityDataset`]: speaker-labeled utterances, seeded train/validation split
//! 3. [`VerificationTrials`]: trial list -> deduplicated enrol/test [`TrialSet`]s
//! 4. [`Collator`]: centering plus evaluation (top window) or training
//!    (random window) clipping, then [`PaddedBatch::pad`]
//! 5. [`ContrastiveSampler`] + [`Siamese`]: index-pair batches with both
//!    same-speaker and cross-speaker pairs
//!
//! # Deduplication
//!
//! Trial lists reuse a small pool of enrol utterances across many
//! trials. A [`TrialSet`] stores each distinct path once and maps trials
//! to it through [`TrialSet::sample_idxs`]:
//!
//! ```text
//! trial j ──sample_idxs[j]──> distinct index ──load──> frames (once)
//! ```

mod collate;
mod dataset;
mod error;
pub mod loader;
mod sampler;
mod siamese;
mod speaker;
mod store;
mod trials;

pub use collate::{Batch, Collator, PadMode, PaddedBatch, center, clip_random, clip_top};
pub use dataset::{DatasetOptions, FeatureSet, IdentityDataset};
pub use error::DataError;
pub use sampler::{ContrastiveSampler, IndexPair, epoch_seed, sample_epoch, shuffled_batches};
pub use siamese::{PairBatch, Siamese, SiamesePair, collate_pairs};
pub use speaker::{SpeakerPattern, SpeakerSet, VOXCELEB_ID_BASE};
pub use store::{Frames, MemoryStore, NpyStore, Utterance, UtteranceStore};
pub use trials::{Trial, TrialSet, VerificationTrials, parse_trials, parse_trials_str};
