//! `train` command: resume a session and run its remaining stages.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;
use trellis_abstraction::Backend;
use trellis_training::{train_session, ClassRegistry, Saver, StdoutProgressSink};

pub fn execute<B: Backend>(registry: &ClassRegistry<B>, session_dir: PathBuf) -> Result<()> {
    let saver = Saver::new(session_dir.clone());
    let mut session = saver
        .load_from_latest_checkpoint(registry)
        .with_context(|| format!("Failed to restore session from {}", session_dir.display()))?;

    info!(
        session_dir = %session_dir.display(),
        checkpoint = session.progress.epochs_done_total(),
        "Restored session"
    );
    if session.progress.is_finished() {
        println!("{}", "All stages are already completed.".dimmed());
        return Ok(());
    }

    train_session(&mut session, &saver, &StdoutProgressSink).context("Training failed")?;

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Epochs: {}", session.progress.epochs_done_total());
    println!("  Metrics: {}", saver.layout().metrics_dir().display().to_string().dimmed());
    println!();
    Ok(())
}
