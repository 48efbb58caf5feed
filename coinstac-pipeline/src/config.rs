//! Manager configuration
//!
//! Defines all configurable parameters of a pipeline manager: which side of
//! a decentralized run this node plays, where it keeps run files and how
//! long it waits for peers. The message broker is reached through the
//! transport handed to the manager.

use coinstac_core::domain::run::RunMode;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Pipeline manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Local participant or remote aggregator
    pub mode: RunMode,

    /// Unique identifier of this node, doubles as the participant username
    pub client_id: String,

    /// Root of every run's input, output and scratch directories
    pub operating_directory: PathBuf,

    /// How long to wait for peers when neither run nor step says otherwise
    pub peer_timeout: Duration,

    /// Capacity of each run's state event channel
    pub state_buffer: usize,

    /// Container CLI used by the default driver
    pub container_binary: String,

    /// Pull a run's images before its first step
    pub pull_images: bool,
}

impl ManagerConfig {
    /// Creates a new configuration with defaults
    pub fn new(mode: RunMode, client_id: impl Into<String>, operating_directory: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            client_id: client_id.into(),
            operating_directory: operating_directory.into(),
            peer_timeout: Duration::from_secs(300),
            state_buffer: 64,
            container_binary: "podman".to_string(),
            pull_images: true,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - COINSTAC_MODE (required, `local` or `remote`)
    /// - COINSTAC_CLIENT_ID (required)
    /// - COINSTAC_OPERATING_DIR (required)
    /// - plus the optional ones read by [`Self::with_env_overrides`]
    pub fn from_env() -> Result<Self> {
        let mode = std::env::var("COINSTAC_MODE")
            .map_err(|_| PipelineError::Config("COINSTAC_MODE environment variable not set".to_string()))?
            .parse::<RunMode>()
            .map_err(PipelineError::Config)?;

        let client_id = std::env::var("COINSTAC_CLIENT_ID").map_err(|_| {
            PipelineError::Config("COINSTAC_CLIENT_ID environment variable not set".to_string())
        })?;

        let operating_directory = std::env::var("COINSTAC_OPERATING_DIR").map_err(|_| {
            PipelineError::Config("COINSTAC_OPERATING_DIR environment variable not set".to_string())
        })?;

        Ok(Self::new(mode, client_id, operating_directory).with_env_overrides())
    }

    /// Applies the optional environment variables
    ///
    /// - COINSTAC_PEER_TIMEOUT (seconds, default: 300)
    /// - COINSTAC_STATE_BUFFER (default: 64)
    /// - COINSTAC_CONTAINER_BINARY (default: podman)
    ///
    /// Unparseable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self.peer_timeout = lookup("COINSTAC_PEER_TIMEOUT")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.peer_timeout);

        self.state_buffer = lookup("COINSTAC_STATE_BUFFER")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(self.state_buffer);

        if let Some(binary) = lookup("COINSTAC_CONTAINER_BINARY") {
            self.container_binary = binary;
        }

        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn without_image_pull(mut self) -> Self {
        self.pull_images = false;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(PipelineError::Config("client_id cannot be empty".to_string()));
        }

        if self.operating_directory.as_os_str().is_empty() {
            return Err(PipelineError::Config(
                "operating_directory cannot be empty".to_string(),
            ));
        }

        if self.peer_timeout.is_zero() {
            return Err(PipelineError::Config(
                "peer_timeout must be greater than 0".to_string(),
            ));
        }

        if self.state_buffer == 0 {
            return Err(PipelineError::Config(
                "state_buffer must be greater than 0".to_string(),
            ));
        }

        if self.container_binary.trim().is_empty() {
            return Err(PipelineError::Config(
                "container_binary cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
