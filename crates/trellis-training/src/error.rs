use std::path::PathBuf;
use thiserror::Error;
use trellis_abstraction::ComponentError;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to import class `{class}` for group `{group}`; available: [{}]", available.join(", "))]
    ClassImport { group: String, class: String, available: Vec<String> },

    #[error("failed to import function `{name}`; available: [{}]", available.join(", "))]
    FunctionImport { name: String, available: Vec<String> },

    #[error("invalid session spec: {0}")]
    InvalidSpec(String),

    #[error("bad split: {0}")]
    BadSplit(String),

    #[error("missing key `{key}` in batch lookup table; available: [{}]", available.join(", "))]
    MissingKey { key: String, available: Vec<String> },

    #[error("all stages are completed")]
    StopTraining,

    #[error("session already exists: {}", .0.display())]
    SessionExists(PathBuf),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("component error: {0}")]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    /// The progress state machine reached its terminal state. Not a failure.
    #[must_use]
    pub fn is_stop_signal(&self) -> bool {
        matches!(self, Self::StopTraining)
    }

    pub(crate) fn missing_key<'a>(key: &str, available: impl IntoIterator<Item = &'a String>) -> Self {
        Self::MissingKey { key: key.to_string(), available: available.into_iter().cloned().collect() }
    }
}
