//! Run context
//!
//! Everything a pipeline run needs to know about where it runs:
//! - Identity of the run and of this node
//! - Participants expected in decentralized steps
//! - Per-run operating directories
//! - File listings backing `files` input mappings

use coinstac_core::domain::run::RunMode;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Per-run directories under the manager's operating directory
///
/// `<root>/{input,output,transfer,system}/<client>/<run>`. `transfer` and
/// `system` are scratch space and go away when the run ends; `input` and
/// `output` belong to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectories {
    pub input: PathBuf,
    pub output: PathBuf,
    pub transfer: PathBuf,
    pub system: PathBuf,
}

impl RunDirectories {
    pub fn new(root: &Path, client_id: &str, run_id: &str) -> Self {
        let dir = |kind: &str| root.join(kind).join(client_id).join(run_id);
        Self {
            input: dir("input"),
            output: dir("output"),
            transfer: dir("transfer"),
            system: dir("system"),
        }
    }

    /// Creates all four directories
    pub async fn create(&self) -> Result<()> {
        for dir in [&self.input, &self.output, &self.transfer, &self.system] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                PipelineError::Config(format!(
                    "Failed to create run directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Removes the scratch directories, logging instead of failing
    pub async fn remove_scratch(&self) {
        for dir in [&self.transfer, &self.system] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => debug!("Removed scratch directory {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove scratch directory {}: {}", dir.display(), e),
            }
        }
    }
}

/// Identity and environment of one run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub client_id: String,
    pub mode: RunMode,
    /// Participants of decentralized steps
    pub clients: Vec<String>,
    pub directories: RunDirectories,
    /// Files available to `files` input mappings, by source name
    pub file_listings: BTreeMap<String, Vec<String>>,
    /// Peer wait when a step does not declare its own
    pub peer_timeout: Duration,
}

impl RunContext {
    /// How long to wait for peers in a step declaring `timeout_ms`
    pub fn peer_timeout_for(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.peer_timeout)
    }
}
