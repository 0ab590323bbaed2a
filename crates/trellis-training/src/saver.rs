//! Session directory persistence: creation, checkpoints and restoration.

use crate::error::{TrainingError, TrainingResult};
use crate::history::TrainingHistory;
use crate::layout::SessionLayout;
use crate::loaders::SessionBuilder;
use crate::persistence::{atomic_write, ObjectPersistence};
use crate::registry::ClassRegistry;
use crate::session::{Progress, ProgressBar, Session, Stage};
use crate::spec::ObjectGroup;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};
use trellis_abstraction::{Backend, StateRecord};

/// Snapshot of everything that changes while training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub models: BTreeMap<String, StateRecord>,
    pub optimizers: BTreeMap<String, StateRecord>,
    pub progress: Vec<ProgressBar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub epoch: usize,
    pub created_at: DateTime<Utc>,
    pub sha256: String,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reads and writes one session directory.
#[derive(Debug, Clone)]
pub struct Saver {
    layout: SessionLayout,
}

impl Saver {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { layout: SessionLayout::new(root) }
    }

    #[must_use]
    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    fn static_state(&self) -> ObjectPersistence {
        ObjectPersistence::new(self.layout.static_dir())
    }

    /// Create the directory, write the spec, static state and checkpoint 0.
    pub fn initial_save<B: Backend>(&self, spec: &Value, session: &Session<B>) -> TrainingResult<()> {
        self.layout.create_dirs()?;
        atomic_write(&self.layout.spec_path(), &serde_json::to_string_pretty(spec)?)?;
        self.save_static(session)?;
        let epoch = self.save_checkpoint(session)?;
        info!(session = %self.layout.root().display(), checkpoint = epoch, "Session created");
        Ok(())
    }

    pub fn save_static<B: Backend>(&self, session: &Session<B>) -> TrainingResult<()> {
        let persistence = self.static_state();
        for group in ObjectGroup::ALL.into_iter().filter(|g| g.is_static()) {
            for name in session.names(group) {
                if let Some(object) = session.component(group, &name) {
                    persistence.save(&name, object)?;
                }
            }
        }
        Ok(())
    }

    pub fn read_spec(&self) -> TrainingResult<Value> {
        Ok(serde_json::from_str(&std::fs::read_to_string(self.layout.spec_path())?)?)
    }

    /// Rebuild the session from its spec and static state, then load the latest checkpoint.
    pub fn load_from_latest_checkpoint<B: Backend>(&self, registry: &ClassRegistry<B>) -> TrainingResult<Session<B>> {
        let spec = self.read_spec()?;
        let mut session = SessionBuilder::restoring(registry, self.static_state()).build(&spec)?;
        let epoch = self.layout.latest_checkpoint()?;
        self.load_checkpoint(&mut session, epoch)?;
        for (stage, bar) in session.stages.iter().zip(session.progress.bars()) {
            let dropped = self.history(stage).truncate_after(bar.epochs_done)?;
            if dropped > 0 {
                warn!(stage = %stage.name, epochs_done = bar.epochs_done, dropped, "Dropped history rows past the checkpoint");
            }
        }
        info!(session = %self.layout.root().display(), checkpoint = epoch, "Session restored");
        Ok(session)
    }

    /// Write a checkpoint named after the total number of epochs trained.
    pub fn save_checkpoint<B: Backend>(&self, session: &Session<B>) -> TrainingResult<usize> {
        let epoch = session.progress.epochs_done_total();
        let dir = self.layout.checkpoint_dir(epoch);
        if dir.exists() {
            return Err(TrainingError::Checkpoint(format!("checkpoint {epoch} already exists")));
        }

        let checkpoint = Checkpoint {
            models: session
                .models
                .iter()
                .map(|(name, model)| (name.clone(), model.state_dict().unwrap_or_else(|| json!({}))))
                .collect(),
            optimizers: session
                .optimizers
                .iter()
                .map(|(name, optimizer)| (name.clone(), optimizer.state_dict().unwrap_or_else(|| json!({}))))
                .collect(),
            progress: session.progress.to_list(),
        };
        let body = serde_json::to_string_pretty(&checkpoint)?;
        let manifest = CheckpointManifest { epoch, created_at: Utc::now(), sha256: sha256_hex(body.as_bytes()) };

        std::fs::create_dir_all(&dir)?;
        atomic_write(&self.layout.checkpoint_path(epoch), &body)?;
        atomic_write(&self.layout.manifest_path(epoch), &serde_json::to_string_pretty(&manifest)?)?;
        info!(checkpoint = epoch, "Checkpoint saved");
        Ok(epoch)
    }

    pub fn read_checkpoint(&self, epoch: usize) -> TrainingResult<Checkpoint> {
        let body = std::fs::read_to_string(self.layout.checkpoint_path(epoch))?;
        let manifest_path = self.layout.manifest_path(epoch);
        if manifest_path.exists() {
            let manifest: CheckpointManifest = serde_json::from_str(&std::fs::read_to_string(manifest_path)?)?;
            let digest = sha256_hex(body.as_bytes());
            if manifest.sha256 != digest {
                return Err(TrainingError::Checkpoint(format!(
                    "checkpoint {epoch} is corrupted: expected sha256 {}, found {digest}",
                    manifest.sha256
                )));
            }
        } else {
            warn!(checkpoint = epoch, "Checkpoint has no manifest, skipping digest check");
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub fn load_checkpoint<B: Backend>(&self, session: &mut Session<B>, epoch: usize) -> TrainingResult<()> {
        let checkpoint = self.read_checkpoint(epoch)?;
        let progress = Progress::from_list(checkpoint.progress)?;
        if progress.bars().len() != session.stages.len() {
            return Err(TrainingError::Checkpoint(format!(
                "checkpoint {epoch} tracks {} stages but the session has {}",
                progress.bars().len(),
                session.stages.len()
            )));
        }

        for (name, state) in checkpoint.models {
            let model = session.models.get_mut(&name).ok_or_else(|| {
                TrainingError::Checkpoint(format!("checkpoint {epoch} holds unknown model `{name}`"))
            })?;
            model
                .load_state_dict(state)
                .map_err(|e| TrainingError::Checkpoint(format!("cannot restore model `{name}`: {e}")))?;
        }
        for (name, state) in checkpoint.optimizers {
            let optimizer = session.optimizers.get_mut(&name).ok_or_else(|| {
                TrainingError::Checkpoint(format!("checkpoint {epoch} holds unknown optimizer `{name}`"))
            })?;
            optimizer
                .load_state_dict(state)
                .map_err(|e| TrainingError::Checkpoint(format!("cannot restore optimizer `{name}`: {e}")))?;
        }
        session.progress = progress;
        Ok(())
    }

    #[must_use]
    pub fn history(&self, stage: &Stage) -> TrainingHistory {
        TrainingHistory::new(self.layout.metrics_path(&stage.name), &stage.metrics, stage.val_dataset.is_some())
    }

    pub fn log_metrics(
        &self,
        stage: &Stage,
        epoch: usize,
        train: &BTreeMap<String, f64>,
        val: Option<&BTreeMap<String, f64>>,
    ) -> TrainingResult<()> {
        self.history(stage).append(epoch, train, val)
    }
}

/// Build a session from a spec document without touching the filesystem.
pub fn create_session<B: Backend>(registry: &ClassRegistry<B>, spec: &Value) -> TrainingResult<Session<B>> {
    SessionBuilder::new(registry).build(spec)
}

/// Build a session and write its initial state to `dir`.
pub fn create_and_save_session<B: Backend>(
    registry: &ClassRegistry<B>,
    spec: &Value,
    dir: PathBuf,
) -> TrainingResult<(Session<B>, Saver)> {
    let saver = Saver::new(dir);
    if saver.layout().root().exists() {
        return Err(TrainingError::SessionExists(saver.layout().root().to_path_buf()));
    }
    let session = create_session(registry, spec)?;
    saver.initial_save(spec, &session)?;
    Ok((session, saver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{toy_registry, toy_spec};
    use tempfile::TempDir;

    #[test]
    fn test_initial_save_writes_layout() {
        let temp = TempDir::new().unwrap();
        let registry = toy_registry();
        let (_, saver) = create_and_save_session(&registry, &toy_spec(), temp.path().join("run")).unwrap();
        let layout = saver.layout();

        assert_eq!(saver.read_spec().unwrap(), toy_spec());
        assert!(layout.static_dir().join("points.json").exists());
        assert!(layout.static_dir().join("holdout.json").exists());
        assert!(layout.static_dir().join("vocab.json").exists());
        assert!(!layout.static_dir().join("affine.json").exists());
        assert_eq!(layout.checkpoint_epochs().unwrap(), vec![0]);
        assert!(layout.manifest_path(0).exists());
    }

    #[test]
    fn test_existing_session_is_not_overwritten() {
        let temp = TempDir::new().unwrap();
        let registry = toy_registry();
        let dir = temp.path().join("run");
        create_and_save_session(&registry, &toy_spec(), dir.clone()).unwrap();

        let err = create_and_save_session(&registry, &toy_spec(), dir).unwrap_err();
        assert!(matches!(err, TrainingError::SessionExists(_)));
    }

    #[test]
    fn test_checkpoint_round_trip_restores_state() {
        let temp = TempDir::new().unwrap();
        let registry = toy_registry();
        let (mut session, saver) = create_and_save_session(&registry, &toy_spec(), temp.path().join("run")).unwrap();

        session.models.get_mut("affine").unwrap().load_state_dict(json!({"weight": 1.5, "bias": -0.5})).unwrap();
        session.progress.increment_progress().unwrap();
        session.progress.increment_progress().unwrap();
        session.progress.mark_completed().unwrap();
        assert_eq!(saver.save_checkpoint(&session).unwrap(), 2);

        let restored = saver.load_from_latest_checkpoint(&registry).unwrap();
        assert_eq!(restored.models["affine"].state_dict(), session.models["affine"].state_dict());
        assert_eq!(restored.optimizers["sgd"].state_dict(), session.optimizers["sgd"].state_dict());
        assert_eq!(restored.progress, session.progress);
        assert_eq!(restored.progress.current_stage_id().unwrap(), 1);
        assert_eq!(
            restored.splits["holdout"].splitter.shuffled(),
            session.splits["holdout"].splitter.shuffled()
        );
    }

    #[test]
    fn test_checkpoints_are_immutable() {
        let temp = TempDir::new().unwrap();
        let registry = toy_registry();
        let (session, saver) = create_and_save_session(&registry, &toy_spec(), temp.path().join("run")).unwrap();
        let err = saver.save_checkpoint(&session).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_corrupted_checkpoint_is_detected() {
        let temp = TempDir::new().unwrap();
        let registry = toy_registry();
        let (_, saver) = create_and_save_session(&registry, &toy_spec(), temp.path().join("run")).unwrap();

        let path = saver.layout().checkpoint_path(0);
        let tampered = std::fs::read_to_string(&path).unwrap().replace("\"epochs_done\": 0", "\"epochs_done\": 5");
        std::fs::write(&path, tampered).unwrap();

        let err = saver.read_checkpoint(0).unwrap_err();
        assert!(err.to_string().contains("corrupted"));
    }

    #[test]
    fn test_unknown_model_in_checkpoint_is_rejected() {
        let temp = TempDir::new().unwrap();
        let registry = toy_registry();
        let (mut session, saver) = create_and_save_session(&registry, &toy_spec(), temp.path().join("run")).unwrap();

        let checkpoint = Checkpoint {
            models: BTreeMap::from([("decoder".to_string(), json!({}))]),
            optimizers: BTreeMap::new(),
            progress: session.progress.to_list(),
        };
        let dir = saver.layout().checkpoint_dir(7);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(saver.layout().checkpoint_path(7), serde_json::to_string(&checkpoint).unwrap()).unwrap();

        let err = saver.load_checkpoint(&mut session, 7).unwrap_err();
        assert!(err.to_string().contains("decoder"));
    }
}
