//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod pull;
mod run;
mod validate;

use anyhow::{Context, Result};
use clap::Subcommand;
use coinstac_core::domain::pipeline::PipelineSpec;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Check a pipeline specification without running it
    Validate {
        /// Path to the pipeline specification (JSON)
        spec: PathBuf,
    },
    /// Run a pipeline on this machine
    Run(run::RunArgs),
    /// Pull every image a pipeline needs
    Pull {
        /// Path to the pipeline specification (JSON)
        spec: PathBuf,
    },
}

/// Handle a CLI command
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Validate { spec } => validate::handle_validate(&spec),
        Commands::Run(args) => run::handle_run(args, config).await,
        Commands::Pull { spec } => pull::handle_pull(&spec, config).await,
    }
}

/// Reads and parses a pipeline specification file
pub(crate) fn load_spec(path: &Path) -> Result<PipelineSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse pipeline file: {}", path.display()))
}
