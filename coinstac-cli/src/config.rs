//! Configuration module
//!
//! Settings shared by every command.

use std::path::PathBuf;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Where managers keep per-run directories
    pub operating_dir: PathBuf,
    /// Container CLI for docker computations
    pub container_binary: String,
}
