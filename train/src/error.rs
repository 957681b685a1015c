use std::path::PathBuf;

use thiserror::Error;
use voxver_data::DataError;

/// Errors returned by training and evaluation.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("train: EER undefined with {positives} positive and {negatives} negative trials")]
    EmptyTrialSet { positives: usize, negatives: usize },

    #[error("train: model: {0}")]
    Model(String),

    #[error("train: trial {trial} has non-finite score {score}")]
    NonFiniteScore { trial: usize, score: f32 },

    #[error("train: checkpoint {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error("train: epoch {epoch}: {source}")]
    Epoch {
        epoch: u32,
        #[source]
        source: Box<TrainError>,
    },

    #[error("train: invalid configuration: {0}")]
    Config(String),
}

impl TrainError {
    /// Wraps the error with the epoch it happened in.
    pub fn in_epoch(self, epoch: u32) -> Self {
        match self {
            Self::Epoch { .. } => self,
            other => Self::Epoch {
                epoch,
                source: Box::new(other),
            },
        }
    }

    /// Reports whether the error is a configuration error.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Data(e) => e.is_configuration(),
            Self::Config(_) => true,
            Self::Epoch { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}
