//! Training configuration, loadable from YAML.
//!
//! Every field has a default, so a file only lists what it changes:
//!
//! ```yaml
//! epochs: 20
//! mode: verification
//! optimizer:
//!   lr: 0.001
//! margin:
//!   kind: fixed
//!   margin: 1.5
//! data:
//!   train_root: /data/vox1/dev
//!   test_root: /data/vox1/test
//!   trial_file: /data/vox1/veri_test.txt
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::TrainError;
use crate::loss::{MarginPolicy, TrainingMode};
use crate::optim::AdamConfig;

/// Where the corpus lives and which speakers are trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train_root: Option<PathBuf>,
    pub test_root: Option<PathBuf>,
    pub trial_file: Option<PathBuf>,
    /// Speakers `0..num_speakers` (after base subtraction) are used.
    pub num_speakers: u32,
    pub id_base: u32,
    /// Fraction of the training corpus kept for training; the rest
    /// validates.
    pub split: f64,
    pub preload: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_root: None,
            test_root: None,
            trial_file: None,
            num_speakers: 1200,
            id_base: voxver_data::VOXCELEB_ID_BASE,
            split: 0.8,
            preload: false,
        }
    }
}

/// Reference model shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub feature_dim: usize,
    pub embedding_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            feature_dim: 40,
            embedding_dim: 256,
        }
    }
}

/// Per-epoch schedule of the contrastive weight `alpha`: it starts at
/// `initial` and moves by `step` after every epoch, clamped to
/// `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphaSchedule {
    pub initial: f32,
    pub step: f32,
    pub min: f32,
    pub max: f32,
}

impl Default for AlphaSchedule {
    fn default() -> Self {
        Self {
            initial: 0.5,
            step: 0.0,
            min: 0.0,
            max: 1.0,
        }
    }
}

impl AlphaSchedule {
    pub fn next(&self, current: f32) -> f32 {
        (current + self.step).clamp(self.min, self.max)
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        if !(0.0 <= self.min && self.min <= self.max && self.max <= 1.0)
            || !(self.min..=self.max).contains(&self.initial)
        {
            return Err(TrainError::Config(format!("invalid alpha schedule {self:?}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub mode: TrainingMode,
    pub epochs: u32,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    /// Training clip length; windows are drawn at random.
    pub train_max_frames: usize,
    /// Validation and evaluation clip length; the leading frames are kept.
    pub eval_max_frames: usize,
    /// Batches loaded ahead of the training step.
    pub prefetch: usize,
    pub seed: u64,
    pub checkpoint: PathBuf,
    pub optimizer: AdamConfig,
    pub alpha: AlphaSchedule,
    pub margin: MarginPolicy,
    pub model: ModelConfig,
    pub data: DataConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            mode: TrainingMode::default(),
            epochs: 10,
            batch_size: 100,
            eval_batch_size: 100,
            train_max_frames: 400,
            eval_max_frames: 1000,
            prefetch: 4,
            seed: 0,
            checkpoint: PathBuf::from("voxver.ckpt"),
            optimizer: AdamConfig::default(),
            alpha: AlphaSchedule::default(),
            margin: MarginPolicy::default(),
            model: ModelConfig::default(),
            data: DataConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, TrainError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| TrainError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, TrainError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TrainError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml(&self) -> Result<String, TrainError> {
        serde_yaml::to_string(self).map_err(|e| TrainError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        let min_batch = match self.mode {
            TrainingMode::Verification => 2,
            TrainingMode::Classification => 1,
        };
        if self.batch_size < min_batch {
            return Err(TrainError::Config(format!(
                "{} training needs batch_size >= {min_batch}, got {}",
                self.mode, self.batch_size
            )));
        }
        if self.eval_batch_size == 0 || self.train_max_frames == 0 || self.eval_max_frames == 0 {
            return Err(TrainError::Config(
                "eval_batch_size, train_max_frames and eval_max_frames must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.data.split) {
            return Err(TrainError::Config(format!(
                "split ratio {} is outside [0, 1]",
                self.data.split
            )));
        }
        if self.data.num_speakers == 0 {
            return Err(TrainError::Config("num_speakers must be positive".into()));
        }
        self.optimizer.validate()?;
        self.alpha.validate()?;
        self.margin.validate()
    }
}
