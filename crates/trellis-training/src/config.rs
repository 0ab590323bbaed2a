//! Training loop settings.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};

/// Knobs of the training loop, set globally under `train.settings` and
/// optionally refined per stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TrainingSettings {
    /// Examples per batch (default: 32).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches between two running-average reports (default: 50).
    #[serde(default = "default_report_interval")]
    pub report_interval: usize,

    /// Run evaluation every N epochs of a stage (default: 1).
    #[serde(default = "default_every")]
    pub eval_every: usize,

    /// Maximum number of validation batches per evaluation (default: 32).
    #[serde(default = "default_eval_batches")]
    pub eval_batches: usize,

    /// Write a checkpoint every N epochs of a stage (default: 1).
    #[serde(default = "default_every")]
    pub checkpoint_every: usize,

    /// Visit training examples in a per-epoch seeded random order.
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,

    /// Base seed for per-epoch shuffling.
    #[serde(default)]
    pub seed: u64,
}

fn default_batch_size() -> usize {
    32
}

fn default_report_interval() -> usize {
    50
}

fn default_every() -> usize {
    1
}

fn default_eval_batches() -> usize {
    32
}

fn default_shuffle() -> bool {
    true
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            report_interval: default_report_interval(),
            eval_every: default_every(),
            eval_batches: default_eval_batches(),
            checkpoint_every: default_every(),
            shuffle: default_shuffle(),
            seed: 0,
        }
    }
}

impl TrainingSettings {
    pub fn validate(&self) -> TrainingResult<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("report_interval", self.report_interval),
            ("eval_every", self.eval_every),
            ("eval_batches", self.eval_batches),
            ("checkpoint_every", self.checkpoint_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TrainingError::InvalidSpec(format!("settings.{name} must be >= 1")));
            }
        }
        Ok(())
    }

    /// Seed used to shuffle the training data of `epoch`.
    #[must_use]
    pub fn epoch_seed(&self, epoch: usize) -> u64 {
        self.seed.wrapping_add(epoch as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_defaults() {
        let settings: TrainingSettings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(settings, TrainingSettings::default());
        assert_eq!(settings.batch_size, 32);
        assert_eq!(settings.report_interval, 50);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation_rejects_zero() {
        let settings = TrainingSettings { eval_batches: 0, ..TrainingSettings::default() };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("eval_batches"));
    }

    #[test]
    fn test_settings_reject_unknown_keys() {
        assert!(serde_json::from_value::<TrainingSettings>(json!({"batchsize": 4})).is_err());
    }
}
