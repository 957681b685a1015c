//! Training command.

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use voxver_data::{DatasetOptions, FeatureSet, IdentityDataset, SpeakerPattern, SpeakerSet};
use voxver_train::{EpochStats, PooledLinear, Trainer, TrainingMode};

use super::{build_evaluator, feature_store, load_config, output_result, require_path};
use crate::Cli;

/// Train a speaker model.
///
/// Flags override the matching config values.
#[derive(Args)]
pub struct TrainCommand {
    /// Root of the training corpus
    #[arg(long)]
    train_root: Option<PathBuf>,
    /// Root the trial list paths are relative to
    #[arg(long)]
    test_root: Option<PathBuf>,
    /// Trial list file
    #[arg(long)]
    trials: Option<PathBuf>,
    /// Checkpoint written whenever the EER improves
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Resume from this checkpoint
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Training objective: verification or classification
    #[arg(long)]
    mode: Option<TrainingMode>,
    /// Total number of epochs
    #[arg(long)]
    epochs: Option<u32>,
    /// Training batch size
    #[arg(long)]
    batch_size: Option<usize>,
    /// Learning rate
    #[arg(long)]
    lr: Option<f32>,
    /// Load the whole training corpus into memory first
    #[arg(long)]
    preload: bool,
    /// Print the effective config and exit
    #[arg(long)]
    dry_run: bool,
}

#[derive(Serialize)]
struct TrainReport {
    epochs_completed: u32,
    steps: u64,
    best_eer: Option<f32>,
    checkpoint: PathBuf,
    stopped_early: bool,
    history: Vec<EpochStats>,
}

impl TrainCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut config = load_config(cli)?;
        if let Some(v) = &self.train_root {
            config.data.train_root = Some(v.clone());
        }
        if let Some(v) = &self.test_root {
            config.data.test_root = Some(v.clone());
        }
        if let Some(v) = &self.trials {
            config.data.trial_file = Some(v.clone());
        }
        if let Some(v) = &self.checkpoint {
            config.checkpoint = v.clone();
        }
        if let Some(v) = self.mode {
            config.mode = v;
        }
        if let Some(v) = self.epochs {
            config.epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.lr {
            config.optimizer.lr = v;
        }
        config.data.preload |= self.preload;
        config.validate()?;

        if self.dry_run {
            return output_result(&config, cli.output.as_deref(), cli.json);
        }

        let train_root = require_path(config.data.train_root.as_ref(), "training root", "train_root")?;
        let store = feature_store();
        let full = IdentityDataset::build(
            &train_root,
            &SpeakerSet::first(config.data.num_speakers)?,
            store.clone(),
            &DatasetOptions {
                pattern: SpeakerPattern::new(config.data.id_base),
                preload: config.data.preload,
            },
        )?;
        let (train, val) = full.split(config.data.split, Some(config.seed))?;
        let evaluator = build_evaluator(&config, store)?;
        info!(
            "{} training and {} validation utterances, {} trials",
            train.len(),
            val.len(),
            evaluator.trials().len()
        );

        let model = PooledLinear::new(
            config.model.feature_dim,
            config.model.embedding_dim,
            train.num_speakers(),
            config.seed,
        );
        let checkpoint = config.checkpoint.clone();
        let mut trainer = match &self.resume {
            Some(path) => Trainer::resume(model, config, path)?,
            None => Trainer::new(model, config)?,
        };
        let stop = trainer.stop_handle();

        let mut handle = tokio::task::spawn_blocking(move || {
            let history = trainer.run(&train, &val, &evaluator)?;
            let stopped_early = trainer.state().epoch < trainer.config().epochs;
            Ok::<_, voxver_train::TrainError>((history, trainer.state().clone(), stopped_early))
        });

        let joined = tokio::select! {
            res = &mut handle => res,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, stopping after the current epoch");
                stop.request_stop();
                handle.await
            }
        };
        let (history, state, stopped_early) = joined??;

        let report = TrainReport {
            epochs_completed: state.epoch,
            steps: state.step,
            best_eer: state.best_eer,
            checkpoint,
            stopped_early,
            history,
        };
        output_result(&report, cli.output.as_deref(), cli.json)
    }
}
