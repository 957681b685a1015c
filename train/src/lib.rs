//! Dual-objective speaker verification training.
//!
//! A [`Trainer`] drives a [`SpeakerModel`] through epochs of
//!
//! 1. training, either on contrastive pair batches ([`TrainingMode::Verification`],
//!    loss `alpha * contrastive + (1 - alpha) * nll`) or on labeled batches
//!    ([`TrainingMode::Classification`], NLL only),
//! 2. validation classification error,
//! 3. cosine-scored EER on a trial list ([`VerificationEvaluator`]),
//! 4. a [`Checkpoint`] whenever the EER improves.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use voxver_data::{DatasetOptions, IdentityDataset, NpyStore, SpeakerSet, VerificationTrials};
//! use voxver_train::{PooledLinear, TrainConfig, Trainer, VerificationEvaluator};
//!
//! # fn main() -> Result<(), voxver_train::TrainError> {
//! let config = TrainConfig::default();
//! let store = Arc::new(NpyStore::new());
//! let full = IdentityDataset::build(
//!     Path::new("/data/vox1/dev"),
//!     &SpeakerSet::first(config.data.num_speakers)?,
//!     store.clone(),
//!     &DatasetOptions::default(),
//! )?;
//! let (train, val) = full.split(config.data.split, Some(config.seed))?;
//! let trials = VerificationTrials::build(
//!     Path::new("/data/vox1/veri_test.txt"),
//!     Path::new("/data/vox1/test"),
//!     store,
//! )?;
//! let evaluator = VerificationEvaluator::new(trials, config.eval_max_frames, config.eval_batch_size)?;
//!
//! let model = PooledLinear::new(40, 256, train.num_speakers(), config.seed);
//! let mut trainer = Trainer::new(model, config)?;
//! for epoch in trainer.run(&train, &val, &evaluator)? {
//!     println!("epoch {} eer {:.4}", epoch.epoch, epoch.eer);
//! }
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod config;
mod eer;
mod error;
mod evaluator;
mod loss;
mod model;
mod optim;
mod pooled;
mod trainer;

pub use checkpoint::{CHECKPOINT_VERSION, Checkpoint};
pub use config::{AlphaSchedule, DataConfig, ModelConfig, TrainConfig};
pub use eer::{EerReport, compute_eer, cosine_similarity};
pub use error::TrainError;
pub use evaluator::{VerificationEvaluator, embed_all};
pub use loss::{
    ContrastiveGrads, LossOutput, MarginPolicy, TrainingMode, best_margin, contrastive_loss,
    euclidean, nll_loss,
};
pub use model::{InferenceGuard, ModelOutput, ModelState, OutputGrads, Parameter, SpeakerModel};
pub use optim::{Adam, AdamConfig, AdamState};
pub use pooled::PooledLinear;
pub use trainer::{EpochStats, EpochTrainStats, RunState, StepStats, StopHandle, Trainer};
