use crate::error::{TrainingError, TrainingResult};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Filesystem layout of a session directory.
///
/// ```text
/// <root>/spec.json
/// <root>/static/<name>.json
/// <root>/checkpoints/<epoch>/checkpoint.json
/// <root>/checkpoints/<epoch>/manifest.json
/// <root>/metrics/<stage>.csv
/// ```
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn spec_path(&self) -> PathBuf {
        self.root.join("spec.json")
    }

    #[must_use]
    pub fn static_dir(&self) -> PathBuf {
        self.root.join("static")
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    #[must_use]
    pub fn checkpoint_dir(&self, epoch: usize) -> PathBuf {
        self.checkpoints_dir().join(epoch.to_string())
    }

    #[must_use]
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir(epoch).join("checkpoint.json")
    }

    #[must_use]
    pub fn manifest_path(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir(epoch).join("manifest.json")
    }

    #[must_use]
    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join("metrics")
    }

    #[must_use]
    pub fn metrics_path(&self, stage: &str) -> PathBuf {
        self.metrics_dir().join(format!("{stage}.csv"))
    }

    /// Create the session root and its subdirectories; the root must not exist yet.
    pub fn create_dirs(&self) -> TrainingResult<()> {
        if self.root.exists() {
            return Err(TrainingError::SessionExists(self.root.clone()));
        }
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.static_dir())?;
        std::fs::create_dir_all(self.checkpoints_dir())?;
        std::fs::create_dir_all(self.metrics_dir())?;
        Ok(())
    }

    /// Epoch numbers of the checkpoints on disk, ascending.
    pub fn checkpoint_epochs(&self) -> TrainingResult<Vec<usize>> {
        let mut epochs = Vec::new();
        for entry in std::fs::read_dir(self.checkpoints_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(|n| n.parse::<usize>().ok()) {
                Some(epoch) => epochs.push(epoch),
                None => warn!(entry = ?name, "Ignoring non-numeric checkpoint directory"),
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// The numerically highest checkpoint.
    pub fn latest_checkpoint(&self) -> TrainingResult<usize> {
        self.checkpoint_epochs()?.last().copied().ok_or_else(|| {
            TrainingError::Checkpoint(format!("no checkpoint found under {}", self.checkpoints_dir().display()))
        })
    }
}
