//! `init` command: create a session directory from a spec.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use trellis_abstraction::Backend;
use trellis_training::{create_and_save_session, override_session_spec, ClassRegistry, SessionSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Created(PathBuf),
    AlreadyExists(PathBuf),
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {} as JSON", path.display()))
}

/// Read the spec at `config`, merge `overrides` onto it and create the session.
pub fn execute<B: Backend>(
    registry: &ClassRegistry<B>,
    config: &Path,
    session_dir: Option<PathBuf>,
    overrides: Option<&Path>,
) -> Result<InitOutcome> {
    let mut spec = read_json(config)?;
    if let Some(path) = overrides {
        info!(overrides = %path.display(), "Applying spec overrides");
        spec = override_session_spec(&spec, &read_json(path)?);
    }

    let parsed = SessionSpec::from_value(&spec).context("Invalid session spec")?;
    let dir = session_dir
        .or(parsed.session_dir)
        .context("No session directory given: pass --session-dir or set `session_dir` in the spec")?;

    if dir.exists() {
        warn!(session_dir = %dir.display(), "Session directory already exists, leaving it untouched");
        println!("{} {}", "Session already exists:".yellow(), dir.display());
        return Ok(InitOutcome::AlreadyExists(dir));
    }

    let (session, _) = create_and_save_session(registry, &spec, dir.clone())
        .with_context(|| format!("Failed to create session in {}", dir.display()))?;

    println!();
    println!("{}", "Session created".bold().green());
    println!("  Directory: {}", dir.display().to_string().cyan());
    for (idx, stage) in session.stages.iter().enumerate() {
        println!("  Stage {idx}: {} ({} epochs)", stage.name.cyan(), stage.epochs);
    }
    println!("  Next: {}", format!("trellis train {}", dir.display()).dimmed());
    println!();
    Ok(InitOutcome::Created(dir))
}
