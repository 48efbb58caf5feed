//! Values passed to and returned by the manager

use coinstac_core::domain::pipeline::PipelineSpec;
use coinstac_core::dto::state::{PipelineOutput, StateEvent, StateSnapshot, SuspendedRun};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{PipelineError, Result};

/// Everything needed to start one run
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub spec: PipelineSpec,
    pub run_id: String,
    /// Participants of decentralized steps, required on the aggregator
    pub clients: Vec<String>,
    /// Peer wait for steps that do not declare their own
    pub timeout: Option<Duration>,
    /// Files per source name, for `files` input mappings
    pub file_listings: BTreeMap<String, Vec<String>>,
    pub saved_state: Option<SuspendedRun>,
}

impl StartRequest {
    pub fn new(spec: PipelineSpec, run_id: impl Into<String>) -> Self {
        Self {
            spec,
            run_id: run_id.into(),
            clients: vec![],
            timeout: None,
            file_listings: BTreeMap::new(),
            saved_state: None,
        }
    }

    pub fn with_clients(mut self, clients: Vec<String>) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_files(mut self, source: impl Into<String>, files: Vec<String>) -> Self {
        self.file_listings.insert(source.into(), files);
        self
    }

    /// Resumes a run suspended earlier
    pub fn resume_from(mut self, saved: SuspendedRun) -> Self {
        self.saved_state = Some(saved);
        self
    }
}

/// Final outcome of a run
///
/// Resolves once the run is terminal, its terminal event sent and the run
/// removed from the manager.
pub struct RunResult {
    handle: JoinHandle<Result<PipelineOutput>>,
}

impl RunResult {
    pub(crate) fn new(handle: JoinHandle<Result<PipelineOutput>>) -> Self {
        Self { handle }
    }
}

impl Future for RunResult {
    type Output = Result<PipelineOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| {
            joined.unwrap_or_else(|e| Err(PipelineError::Internal(format!("run supervisor failed: {}", e))))
        })
    }
}

/// A started run
pub struct RunHandle {
    pub run_id: String,
    pub result: RunResult,
    /// Progress snapshots followed by exactly one terminal event
    pub states: broadcast::Receiver<StateEvent>,
}

/// Monitoring view of a manager
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerState {
    pub active_pipelines: BTreeMap<String, StateSnapshot>,
}

/// What happens to running pipelines on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for every run to finish
    Graceful,
    /// Stop every run, then wait for them to wind down
    Force,
}
