//! `status` command: report stage progress from the latest checkpoint.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use trellis_training::{default_stage_name, Saver, SessionSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub name: String,
    pub epochs_done: usize,
    pub epochs: usize,
    pub completed: bool,
}

/// Stage progress together with the checkpoint it was read from.
pub fn collect(session_dir: PathBuf) -> Result<(usize, Vec<StageStatus>)> {
    let saver = Saver::new(session_dir);
    let spec = SessionSpec::from_value(&saver.read_spec().context("Failed to read session spec")?)?;
    let epoch = saver.layout().latest_checkpoint()?;
    let checkpoint = saver.read_checkpoint(epoch)?;

    let stages = checkpoint
        .progress
        .iter()
        .map(|bar| {
            let stage = spec.train.stages.get(bar.stage_id);
            StageStatus {
                name: stage.map_or_else(|| default_stage_name(bar.stage_id), |s| s.resolved_name(bar.stage_id)),
                epochs_done: bar.epochs_done,
                epochs: stage.map_or(0, |s| s.epochs),
                completed: bar.completed,
            }
        })
        .collect();
    Ok((epoch, stages))
}

pub fn execute(session_dir: PathBuf, json_output: bool) -> Result<()> {
    let (checkpoint, stages) = collect(session_dir.clone())
        .with_context(|| format!("Failed to read session status from {}", session_dir.display()))?;

    if json_output {
        let out = json!({
            "checkpoint": checkpoint,
            "stages": stages
                .iter()
                .map(|s| json!({
                    "name": s.name,
                    "epochs_done": s.epochs_done,
                    "epochs": s.epochs,
                    "completed": s.completed,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Session {}", session_dir.display()).bold().cyan());
    println!("  Latest checkpoint: {checkpoint}");
    println!();
    println!("{:<20} {:<10} {}", "Stage", "Epochs", "State");
    println!("{}", "─".repeat(44));
    let mut current_seen = false;
    for stage in stages {
        let state = if stage.completed {
            "completed".green()
        } else if current_seen {
            "pending".dimmed()
        } else {
            current_seen = true;
            "current".yellow()
        };
        println!("{:<20} {:<10} {}", stage.name, format!("{}/{}", stage.epochs_done, stage.epochs), state);
    }
    println!();
    Ok(())
}
