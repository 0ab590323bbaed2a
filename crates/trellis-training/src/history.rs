//! Per-stage metric history, one CSV row per epoch.

use crate::error::TrainingResult;
use crate::persistence::atomic_write;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const EPOCH_COLUMN: &str = "Epoch #";
pub const LOSS_COLUMN: &str = "loss";

/// Appends epoch rows to `metrics/<stage>.csv`.
///
/// Columns are `Epoch #`, the loss, each stage metric, then the same names
/// prefixed with `val ` when the stage has a validation dataset. The header is
/// written with the first row; values missing from a row are left empty.
#[derive(Debug, Clone)]
pub struct TrainingHistory {
    path: PathBuf,
    columns: Vec<String>,
    with_val: bool,
}

impl TrainingHistory {
    #[must_use]
    pub fn new(path: PathBuf, metrics: &[String], with_val: bool) -> Self {
        let columns = std::iter::once(LOSS_COLUMN.to_string()).chain(metrics.iter().cloned()).collect();
        Self { path, columns, with_val }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut header = vec![EPOCH_COLUMN.to_string()];
        header.extend(self.columns.iter().cloned());
        if self.with_val {
            header.extend(self.columns.iter().map(|c| format!("val {c}")));
        }
        header
    }

    pub fn append(
        &self,
        epoch: usize,
        train: &BTreeMap<String, f64>,
        val: Option<&BTreeMap<String, f64>>,
    ) -> TrainingResult<()> {
        let write_header = !self.path.exists();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        if write_header {
            writer.write_record(self.header())?;
        }

        let cell = |values: Option<&BTreeMap<String, f64>>, column: &str| {
            values.and_then(|v| v.get(column)).map(ToString::to_string).unwrap_or_default()
        };
        let mut row = vec![epoch.to_string()];
        row.extend(self.columns.iter().map(|c| cell(Some(train), c)));
        if self.with_val {
            row.extend(self.columns.iter().map(|c| cell(val, c)));
        }
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}

impl TrainingHistory {
    /// Drop rows of epochs after `epoch`, returning how many were removed.
    ///
    /// Used when resuming from a checkpoint older than the last logged epoch,
    /// so replayed epochs are not logged twice.
    pub fn truncate_after(&self, epoch: usize) -> TrainingResult<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let rows = read_history(&self.path)?;
        let total = rows.len();
        let kept: Vec<Vec<String>> = rows
            .into_iter()
            .enumerate()
            .filter(|(idx, row)| {
                *idx == 0 || row.first().and_then(|cell| cell.parse::<usize>().ok()).is_none_or(|e| e <= epoch)
            })
            .map(|(_, row)| row)
            .collect();
        let dropped = total - kept.len();
        if dropped == 0 {
            return Ok(0);
        }

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        for row in &kept {
            writer.write_record(row)?;
        }
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;
        let content = String::from_utf8(bytes).map_err(anyhow::Error::from)?;
        atomic_write(&self.path, &content)?;
        Ok(dropped)
    }
}

/// All rows of a history file, header first.
pub fn read_history(path: &Path) -> TrainingResult<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(rows)
}
