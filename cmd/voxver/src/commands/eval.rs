//! Evaluation command.

use std::fmt::Write as _;
use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use tracing::info;

use voxver_train::{Checkpoint, PooledLinear, SpeakerModel, compute_eer};

use super::{build_evaluator, feature_store, load_config, output_result};
use crate::Cli;

/// Score a trial list with a checkpoint and report its EER.
#[derive(Args)]
pub struct EvalCommand {
    /// Checkpoint to evaluate
    #[arg(long)]
    checkpoint: PathBuf,
    /// Root the trial list paths are relative to
    #[arg(long)]
    test_root: Option<PathBuf>,
    /// Trial list file
    #[arg(long)]
    trials: Option<PathBuf>,
    /// Write per-trial scores (`<score> <label> <enrol> <test>`) to this file
    #[arg(long)]
    scores: Option<PathBuf>,
}

#[derive(Serialize)]
struct EvalReport {
    checkpoint: PathBuf,
    checkpoint_epoch: u32,
    trials: usize,
    positives: usize,
    negatives: usize,
    eer: f32,
    threshold: f32,
}

impl EvalCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut config = load_config(cli)?;
        if let Some(v) = &self.test_root {
            config.data.test_root = Some(v.clone());
        }
        if let Some(v) = &self.trials {
            config.data.trial_file = Some(v.clone());
        }

        let ckpt = Checkpoint::load(&self.checkpoint)?;
        let mut model = PooledLinear::new(
            config.model.feature_dim,
            config.model.embedding_dim,
            config.data.num_speakers as usize,
            config.seed,
        );
        model.load_state(&ckpt.model)?;
        info!(
            "loaded {} (epoch {}, step {})",
            self.checkpoint.display(),
            ckpt.run.epoch,
            ckpt.run.step
        );

        let evaluator = build_evaluator(&config, feature_store())?;
        let (scores, evaluator) = tokio::task::spawn_blocking(move || {
            let scores = evaluator.score(&mut model)?;
            Ok::<_, voxver_train::TrainError>((scores, evaluator))
        })
        .await??;
        let trials = evaluator.trials();
        let report = compute_eer(&scores, &trials.labels)?;

        if let Some(path) = &self.scores {
            let mut out = String::new();
            for (j, score) in scores.iter().enumerate() {
                let enrol = trials.enrol.distinct_paths()[trials.enrol.sample_idxs()[j]].display();
                let test = trials.test.distinct_paths()[trials.test.sample_idxs()[j]].display();
                writeln!(out, "{score:.6} {} {enrol} {test}", u8::from(trials.labels[j]))?;
            }
            std::fs::write(path, out)?;
        }

        let result = EvalReport {
            checkpoint: self.checkpoint.clone(),
            checkpoint_epoch: ckpt.run.epoch,
            trials: trials.len(),
            positives: report.positives,
            negatives: report.negatives,
            eer: report.eer,
            threshold: report.threshold,
        };
        output_result(&result, cli.output.as_deref(), cli.json)
    }
}
