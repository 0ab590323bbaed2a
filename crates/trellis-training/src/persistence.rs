//! Per-object state records stored as `<dir>/<name>.json`.

use crate::error::{TrainingError, TrainingResult};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use trellis_abstraction::{Component, StateRecord};
use uuid::Uuid;

/// Saves and restores the state of named objects.
///
/// An object without state is written as `{}`. A missing record file leaves
/// the object untouched. A non-empty record for an object that cannot restore
/// state is an error: dropping it would lose state silently.
#[derive(Debug, Clone)]
pub struct ObjectPersistence {
    dir: PathBuf,
}

impl ObjectPersistence {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn save(&self, name: &str, object: &dyn Component) -> TrainingResult<()> {
        let record = object.state_dict().unwrap_or_else(|| json!({}));
        fs::create_dir_all(&self.dir)?;
        atomic_write(&self.record_path(name), &serde_json::to_string_pretty(&record)?)?;
        debug!(object = %name, "Saved object state");
        Ok(())
    }

    /// Returns whether a record was found and applied.
    pub fn load(&self, name: &str, object: &mut dyn Component) -> TrainingResult<bool> {
        let path = self.record_path(name);
        if !path.exists() {
            debug!(object = %name, "No persisted state, skipping restore");
            return Ok(false);
        }
        let record: StateRecord = serde_json::from_str(&fs::read_to_string(&path)?)?;
        object
            .load_state_dict(record)
            .map_err(|e| TrainingError::Checkpoint(format!("cannot restore state of `{name}`: {e}")))?;
        debug!(object = %name, "Restored object state");
        Ok(true)
    }
}

/// Write `content` to a temp file beside `file_path`, then rename it into place.
pub(crate) fn atomic_write(file_path: &Path, content: &str) -> TrainingResult<()> {
    let temp_filename = format!(
        "{}.tmp.{}",
        file_path.file_stem().and_then(|s| s.to_str()).unwrap_or("file"),
        Uuid::new_v4()
    );
    let temp_path = file_path.parent().unwrap_or_else(|| Path::new(".")).join(temp_filename);

    fs::write(&temp_path, content).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })?;
    fs::rename(&temp_path, file_path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })?;
    Ok(())
}
