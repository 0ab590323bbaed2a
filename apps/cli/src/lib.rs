//! Trellis CLI - command-line surface for training sessions
//!
//! Classes are registered in code, so this crate is a library: a project
//! binary builds its `ClassRegistry` and hands it to [`run`].
//!
//! ```text
//! trellis init <config.json> [--session-dir DIR] [--override FILE]
//! trellis train <session_dir>
//! trellis status <session_dir> [--json]
//! ```

pub mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use trellis_abstraction::Backend;
use trellis_training::ClassRegistry;

/// Trellis - config-driven multi-stage training sessions
#[derive(Parser, Debug)]
#[command(name = "trellis", author, version, about = "Trellis - config-driven multi-stage training")]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a session directory from a spec file
    ///
    /// Builds every object of the spec, writes the spec, static object state
    /// and checkpoint 0. An existing session directory is reported, never
    /// overwritten.
    Init {
        /// Path to the JSON spec
        config: PathBuf,

        /// Session directory (defaults to the spec's `session_dir`)
        #[arg(long)]
        session_dir: Option<PathBuf>,

        /// JSON file merged onto the spec before building
        #[arg(long = "override")]
        overrides: Option<PathBuf>,
    },

    /// Resume a session from its latest checkpoint and train the remaining stages
    Train {
        /// Session directory created by `init`
        session_dir: PathBuf,
    },

    /// Show the stage progress recorded in the latest checkpoint
    Status {
        /// Session directory created by `init`
        session_dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Install the global fmt subscriber; `RUST_LOG` wins over `--log-level`.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).without_time().with_target(false).try_init();
}

pub fn execute<B: Backend>(cli: Cli, registry: &ClassRegistry<B>) -> anyhow::Result<()> {
    match cli.command {
        Command::Init { config, session_dir, overrides } => {
            commands::init::execute(registry, &config, session_dir, overrides.as_deref()).map(|_| ())
        }
        Command::Train { session_dir } => commands::train::execute(registry, session_dir),
        Command::Status { session_dir, json } => commands::status::execute(session_dir, json),
    }
}

/// Parse the process arguments, set up logging and run the command.
pub fn run<B: Backend>(registry: &ClassRegistry<B>) -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(e) = execute(cli, registry) {
        eprintln!("{} {e:#}", "error:".red().bold());
        return Err(e);
    }
    Ok(())
}
