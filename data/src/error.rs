use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by dataset, trial and sampling operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("data: no speaker id matching id<digits> in path {path}")]
    SpeakerPattern { path: PathBuf },

    #[error("data: speaker id {id} in {path} is below base offset {base}")]
    SpeakerBelowBase { path: PathBuf, id: u32, base: u32 },

    #[error("data: speaker set is empty")]
    EmptySpeakerSet,

    #[error("data: malformed trial line {path}:{line}: {reason}")]
    MalformedTrialLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("data: failed to read sample {path}: {reason}")]
    StorageRead { path: PathBuf, reason: String },

    #[error("data: no samples under {root} belong to the requested speakers")]
    EmptyDataset { root: PathBuf },

    #[error("data: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("data: index {index} out of range for {len} utterances")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("data: frame width mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("data: invalid configuration: {0}")]
    Config(String),
}

impl DataError {
    /// Reports whether the error is a configuration error, i.e. one that
    /// must be fixed before any training can start.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::SpeakerPattern { .. }
                | Self::SpeakerBelowBase { .. }
                | Self::EmptySpeakerSet
                | Self::MalformedTrialLine { .. }
                | Self::Config(_)
        )
    }
}
