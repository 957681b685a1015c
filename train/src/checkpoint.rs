//! Checkpoint files: model parameters, optimizer moments and run state,
//! encoded with MessagePack.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::TrainError;
use crate::model::ModelState;
use crate::optim::AdamState;
use crate::trainer::RunState;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub model: ModelState,
    pub optimizer: AdamState,
    pub run: RunState,
}

impl Checkpoint {
    pub fn new(model: ModelState, optimizer: AdamState, run: RunState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            model,
            optimizer,
            run,
        }
    }

    /// Writes the checkpoint atomically: a reader sees either the previous
    /// file or the complete new one.
    pub fn save(&self, path: &Path) -> Result<(), TrainError> {
        let fail = |reason: String| TrainError::Checkpoint {
            path: path.to_path_buf(),
            reason,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| fail(e.to_string()))?;

        let bytes = rmp_serde::to_vec_named(self).map_err(|e| fail(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| fail(e.to_string()))?;
        tmp.write_all(&bytes).map_err(|e| fail(e.to_string()))?;
        tmp.as_file().sync_all().map_err(|e| fail(e.to_string()))?;
        tmp.persist(path).map_err(|e| fail(e.error.to_string()))?;

        info!(
            path = %path.display(),
            epoch = self.run.epoch,
            step = self.run.step,
            bytes = bytes.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, TrainError> {
        let fail = |reason: String| TrainError::Checkpoint {
            path: path.to_path_buf(),
            reason,
        };
        let bytes = std::fs::read(path).map_err(|e| fail(e.to_string()))?;
        let checkpoint: Self = rmp_serde::from_slice(&bytes).map_err(|e| fail(e.to_string()))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(fail(format!(
                "unsupported version {}, expected {CHECKPOINT_VERSION}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }
}
