//! Epoch loop: train, validate, evaluate, checkpoint.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use voxver_data::loader::prefetch;
use voxver_data::{
    Collator, ContrastiveSampler, DataError, FeatureSet, Frames, IdentityDataset, PadMode,
    PaddedBatch, Siamese, collate_pairs, epoch_seed, shuffled_batches,
};

use crate::TrainError;
use crate::checkpoint::Checkpoint;
use crate::config::TrainConfig;
use crate::eer::EerReport;
use crate::evaluator::VerificationEvaluator;
use crate::loss::TrainingMode;
use crate::model::{InferenceGuard, SpeakerModel};
use crate::optim::Adam;

/// Training progress, saved in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Completed epochs; the next epoch to run.
    pub epoch: u32,
    /// Optimizer steps taken.
    pub step: u64,
    pub margin: f32,
    pub alpha: f32,
    /// Best EER that was successfully checkpointed.
    pub best_eer: Option<f32>,
}

impl RunState {
    pub fn initial(config: &TrainConfig) -> Self {
        Self {
            epoch: 0,
            step: 0,
            margin: config.margin.initial(),
            alpha: config.alpha.initial,
            best_eer: None,
        }
    }
}

/// Requests a cooperative stop, honored between epochs.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub loss: f32,
    pub verification_loss: f32,
    pub classification_loss: f32,
    /// Correct argmax predictions among the anchor rows.
    pub correct: usize,
    pub rows: usize,
}

/// Means over the batches of one training epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochTrainStats {
    pub batches: usize,
    pub loss: f32,
    pub verification_loss: f32,
    pub classification_loss: f32,
    pub train_error: f32,
}

#[derive(Default)]
struct Accum {
    batches: usize,
    loss: f64,
    verification: f64,
    classification: f64,
    correct: usize,
    rows: usize,
}

impl Accum {
    fn add(&mut self, s: &StepStats) {
        self.batches += 1;
        self.loss += s.loss as f64;
        self.verification += s.verification_loss as f64;
        self.classification += s.classification_loss as f64;
        self.correct += s.correct;
        self.rows += s.rows;
    }

    fn finish(&self) -> EpochTrainStats {
        let n = self.batches.max(1) as f64;
        EpochTrainStats {
            batches: self.batches,
            loss: (self.loss / n) as f32,
            verification_loss: (self.verification / n) as f32,
            classification_loss: (self.classification / n) as f32,
            train_error: 1.0 - self.correct as f32 / self.rows.max(1) as f32,
        }
    }
}

/// Summary of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: u32,
    pub batches: usize,
    pub loss: f32,
    pub verification_loss: f32,
    pub classification_loss: f32,
    pub train_error: f32,
    pub val_error: f32,
    pub eer: f32,
    pub threshold: f32,
    /// Contrastive weight used during the epoch.
    pub alpha: f32,
    /// Margin at the end of the epoch.
    pub margin: f32,
    pub checkpointed: bool,
    pub elapsed_secs: f64,
}

pub struct Trainer<M: SpeakerModel> {
    model: M,
    optimizer: Adam,
    config: TrainConfig,
    state: RunState,
    stop: StopHandle,
}

impl<M: SpeakerModel> Trainer<M> {
    pub fn new(model: M, config: TrainConfig) -> Result<Self, TrainError> {
        config.validate()?;
        Ok(Self {
            model,
            optimizer: Adam::new(config.optimizer.clone()),
            state: RunState::initial(&config),
            config,
            stop: StopHandle::default(),
        })
    }

    /// Restores model, optimizer and run state from a checkpoint. The
    /// epoch and step counters continue from the saved values.
    pub fn resume(model: M, config: TrainConfig, checkpoint: &Path) -> Result<Self, TrainError> {
        let mut trainer = Self::new(model, config)?;
        let ckpt = Checkpoint::load(checkpoint)?;
        trainer.model.load_state(&ckpt.model)?;
        trainer.optimizer.load_state(ckpt.optimizer)?;
        trainer.state = ckpt.run;
        info!(
            "resumed from {} at epoch {} step {}",
            checkpoint.display(),
            trainer.state.epoch,
            trainer.state.step
        );
        Ok(trainer)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Snapshot of the current model, optimizer and run state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(
            self.model.state(),
            self.optimizer.state().clone(),
            self.state.clone(),
        )
    }

    /// Runs epochs until `config.epochs` have completed or a stop is
    /// requested. Each epoch trains, measures validation error, evaluates
    /// the trial list and checkpoints when the EER improves.
    pub fn run(
        &mut self,
        train: &IdentityDataset,
        val: &IdentityDataset,
        evaluator: &VerificationEvaluator,
    ) -> Result<Vec<EpochStats>, TrainError> {
        if train.is_empty() {
            return Err(TrainError::Config("training set is empty".into()));
        }
        if train.num_speakers() > self.model.num_speakers() {
            return Err(TrainError::Config(format!(
                "dataset has {} speakers but the model classifies {}",
                train.num_speakers(),
                self.model.num_speakers()
            )));
        }
        info!(
            mode = %self.config.mode,
            start_epoch = self.state.epoch,
            epochs = self.config.epochs,
            train = train.len(),
            val = val.len(),
            trials = evaluator.trials().len(),
            "training started"
        );

        let mut history = Vec::new();
        while self.state.epoch < self.config.epochs {
            if self.stop.is_stop_requested() {
                info!("stop requested, ending before epoch {}", self.state.epoch);
                break;
            }
            let epoch = self.state.epoch;
            let started = Instant::now();
            let alpha = self.state.alpha;

            let trained = self.train_epoch(train).map_err(|e| e.in_epoch(epoch))?;
            let val_error = self.validate(val).map_err(|e| e.in_epoch(epoch))?;
            let report = self.evaluate(evaluator).map_err(|e| e.in_epoch(epoch))?;

            self.state.epoch += 1;
            self.state.alpha = self.config.alpha.next(alpha);
            let checkpointed = self.checkpoint_if_improved(report.eer);

            let stats = EpochStats {
                epoch,
                batches: trained.batches,
                loss: trained.loss,
                verification_loss: trained.verification_loss,
                classification_loss: trained.classification_loss,
                train_error: trained.train_error,
                val_error,
                eer: report.eer,
                threshold: report.threshold,
                alpha,
                margin: self.state.margin,
                checkpointed,
                elapsed_secs: started.elapsed().as_secs_f64(),
            };
            info!(
                "epoch {}: loss={:.4} vloss={:.4} closs={:.4} train_err={:.4} val_err={:.4} eer={:.4} margin={:.3} ({:.1}s)",
                epoch,
                stats.loss,
                stats.verification_loss,
                stats.classification_loss,
                stats.train_error,
                stats.val_error,
                stats.eer,
                stats.margin,
                stats.elapsed_secs
            );
            history.push(stats);
        }
        Ok(history)
    }

    /// One pass over the training set in the configured mode.
    pub fn train_epoch(&mut self, train: &IdentityDataset) -> Result<EpochTrainStats, TrainError> {
        let epoch = self.state.epoch as u64;
        let seed = epoch_seed(self.config.seed, epoch);
        let depth = self.config.prefetch;
        let crop = crop_seed(self.config.seed, epoch);
        let mut collator = Collator::training(self.config.train_max_frames, crop);
        let mut acc = Accum::default();

        match self.config.mode {
            TrainingMode::Verification => {
                let sampler = ContrastiveSampler::new(
                    &train.labels(),
                    train.num_speakers(),
                    self.config.batch_size,
                    self.config.seed,
                )?;
                let siamese = Siamese::new(train);
                prefetch(
                    sampler.epoch(epoch),
                    depth,
                    |pairs: Vec<(usize, usize)>| siamese.load_batch(&pairs),
                    |pairs| -> Result<(), TrainError> {
                        let batch = collate_pairs(&mut collator, pairs);
                        let first = PaddedBatch::pad(&batch.first.sequences, PadMode::Zeros)?;
                        let second = PaddedBatch::pad(&batch.second.sequences, PadMode::Zeros)?;
                        let mut labels = batch.first.labels;
                        labels.extend(batch.second.labels);
                        let stats = self.train_step(&first.concat(&second)?, &labels)?;
                        acc.add(&stats);
                        Ok(())
                    },
                )?;
            }
            TrainingMode::Classification => {
                let batches = shuffled_batches(train.len(), self.config.batch_size, seed)?;
                prefetch(
                    batches,
                    depth,
                    |indices: Vec<usize>| load_labeled(train, &indices),
                    |items| -> Result<(), TrainError> {
                        let batch = collator.collate_labeled(items);
                        let padded = PaddedBatch::pad(&batch.sequences, PadMode::Zeros)?;
                        let stats = self.train_step(&padded, &batch.labels)?;
                        acc.add(&stats);
                        Ok(())
                    },
                )?;
            }
        }
        Ok(acc.finish())
    }

    /// Zero grads, forward, loss, backward and one optimizer update.
    pub fn train_step(&mut self, batch: &PaddedBatch, labels: &[u32]) -> Result<StepStats, TrainError> {
        self.model.zero_grad();
        let output = self.model.forward(batch)?;
        let loss = self
            .config
            .mode
            .compute_loss(&output, labels, self.state.alpha, self.state.margin)?;
        if !loss.total.is_finite() {
            return Err(TrainError::Model(format!(
                "non-finite loss {} at step {}",
                loss.total, self.state.step
            )));
        }
        self.model.backward(&loss.grads)?;
        self.optimizer.step(self.model.parameters_mut())?;
        self.state.step += 1;
        self.state.margin = self
            .config
            .margin
            .update(self.state.margin, &loss.distances, &loss.same);

        let correct = output
            .predictions()
            .iter()
            .zip(labels)
            .take(loss.anchor_rows)
            .filter(|(p, l)| p == l)
            .count();
        debug!(
            step = self.state.step,
            loss = loss.total,
            vloss = loss.verification,
            closs = loss.classification,
            margin = self.state.margin,
            "train step"
        );
        Ok(StepStats {
            loss: loss.total,
            verification_loss: loss.verification,
            classification_loss: loss.classification,
            correct,
            rows: loss.anchor_rows,
        })
    }

    /// Classification error on `val`, with the model in inference mode.
    pub fn validate(&mut self, val: &IdentityDataset) -> Result<f32, TrainError> {
        if val.is_empty() {
            warn!("validation set is empty, reporting zero error");
            return Ok(0.0);
        }
        let indices: Vec<usize> = (0..val.len()).collect();
        let chunks: Vec<Vec<usize>> = indices
            .chunks(self.config.eval_batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let mut collator = Collator::evaluation(self.config.eval_max_frames);
        let depth = self.config.prefetch;
        let mut model = InferenceGuard::new(&mut self.model);
        let mut correct = 0usize;

        prefetch(
            chunks,
            depth,
            |indices: Vec<usize>| load_labeled(val, &indices),
            |items| -> Result<(), TrainError> {
                let batch = collator.collate_labeled(items);
                let padded = PaddedBatch::pad(&batch.sequences, PadMode::Wrap)?;
                let output = model.forward(&padded)?;
                correct += output
                    .predictions()
                    .iter()
                    .zip(&batch.labels)
                    .filter(|(p, l)| p == l)
                    .count();
                Ok(())
            },
        )?;
        Ok(1.0 - correct as f32 / val.len() as f32)
    }

    pub fn evaluate(&mut self, evaluator: &VerificationEvaluator) -> Result<EerReport, TrainError> {
        evaluator.evaluate(&mut self.model)
    }

    /// Saves a checkpoint when `eer` is strictly below the best one saved
    /// so far. A failed write is logged and leaves the best EER unchanged.
    pub fn checkpoint_if_improved(&mut self, eer: f32) -> bool {
        if !eer.is_finite() {
            warn!("EER {} is not finite, skipping checkpoint", eer);
            return false;
        }
        if let Some(best) = self.state.best_eer.filter(|&best| eer >= best) {
            debug!("EER {:.4} does not improve on {:.4}", eer, best);
            return false;
        }

        let mut ckpt = self.checkpoint();
        ckpt.run.best_eer = Some(eer);
        match ckpt.save(&self.config.checkpoint) {
            Ok(()) => {
                self.state.best_eer = Some(eer);
                true
            }
            Err(e) => {
                error!("checkpoint write failed, best EER stays {:?}: {}", self.state.best_eer, e);
                false
            }
        }
    }
}

const CROP_SEED_SALT: u64 = 0xC3A5_C85C_97CB_3127;

/// Seed of the training crop offsets for `epoch`, kept apart from the
/// stream that draws the epoch's batches.
fn crop_seed(seed: u64, epoch: u64) -> u64 {
    epoch_seed(seed ^ CROP_SEED_SALT, epoch)
}

fn load_labeled(set: &IdentityDataset, indices: &[usize]) -> Result<Vec<(Frames, u32)>, DataError> {
    indices
        .par_iter()
        .map(|&i| set.get(i).map(|(u, label)| (u.frames, label)))
        .collect()
}
