//! Utility functions for CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use voxver_data::{NpyStore, UtteranceStore, VerificationTrials};
use voxver_train::{TrainConfig, VerificationEvaluator};

use crate::Cli;

/// Loads the training config from `--config`, or the defaults.
pub fn load_config(cli: &Cli) -> anyhow::Result<TrainConfig> {
    match cli.config.as_deref() {
        Some(path) => Ok(TrainConfig::from_yaml_file(Path::new(path))?),
        None => Ok(TrainConfig::default()),
    }
}

/// Returns a configured path or an error naming the missing setting.
pub fn require_path(value: Option<&PathBuf>, what: &str, flag: &str) -> anyhow::Result<PathBuf> {
    value.cloned().ok_or_else(|| {
        anyhow::anyhow!(
            "{what} is required, set data.{flag} in the config or pass --{}",
            flag.replace('_', "-")
        )
    })
}

pub fn feature_store() -> Arc<dyn UtteranceStore> {
    Arc::new(NpyStore::new())
}

/// Builds the trial-list evaluator from the config's data section.
pub fn build_evaluator(
    config: &TrainConfig,
    store: Arc<dyn UtteranceStore>,
) -> anyhow::Result<VerificationEvaluator> {
    let trial_file = require_path(config.data.trial_file.as_ref(), "trial list", "trial_file")?;
    let test_root = require_path(config.data.test_root.as_ref(), "test root", "test_root")?;
    let trials = VerificationTrials::build(&trial_file, &test_root, store)?;
    Ok(
        VerificationEvaluator::new(trials, config.eval_max_frames, config.eval_batch_size)?
            .with_prefetch(config.prefetch),
    )
}

/// Outputs result as JSON or YAML.
pub fn output_result<T: serde::Serialize>(
    result: &T,
    output_path: Option<&str>,
    as_json: bool,
) -> anyhow::Result<()> {
    let output = if as_json {
        serde_json::to_string_pretty(result)? + "\n"
    } else {
        serde_yaml::to_string(result)?
    };

    match output_path {
        Some(path) => std::fs::write(path, output)?,
        None => print!("{}", output),
    }

    Ok(())
}
