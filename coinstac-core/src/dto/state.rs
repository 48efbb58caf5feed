//! Run observability and result records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::domain::run::{RunMode, RunStatus};
use crate::dto::transport::{PluginState, RemoteResult};

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub run_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub step: usize,
    pub step_id: String,
    pub iteration: u32,
    /// Participants that have not contributed to the current counter
    #[serde(default)]
    pub waiting_on: Vec<String>,
    /// Committed cache variables per step
    #[serde(default)]
    pub cache: BTreeMap<usize, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    pub timestamp: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn pending(run_id: impl Into<String>, mode: RunMode) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            status: RunStatus::Pending,
            step: 0,
            step_id: String::new(),
            iteration: 0,
            waiting_on: vec![],
            cache: BTreeMap::new(),
            output: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Complete,
    Error,
    Cancelled,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalStatus::Complete => write!(f, "complete"),
            TerminalStatus::Error => write!(f, "error"),
            TerminalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Emitted exactly once per run, when it finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEvent {
    pub run_id: String,
    pub status: TerminalStatus,
    pub detail: JsonValue,
}

/// Everything a run's state channel carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StateEvent {
    Update(StateSnapshot),
    Terminal(TerminalEvent),
}

/// Per-step accounting in a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub id: String,
    pub iterations: u32,
    pub duration_ms: u64,
}

/// Final result of a successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutput {
    pub run_id: String,
    /// Output of the last step
    pub output: JsonValue,
    pub steps: Vec<StepSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Force-saved progress of the step that was running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCheckpoint {
    pub step: usize,
    pub iteration: u32,
    /// Input the next iteration starts from
    pub next_input: JsonValue,
    #[serde(default)]
    pub computation_cache: JsonValue,
    #[serde(default)]
    pub plugin_state: PluginState,
    /// Last aggregator answer a participant received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remote: Option<RemoteResult>,
}

/// A run stopped with enough state to be resumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendedRun {
    pub run_id: String,
    pub current_step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<StepCheckpoint>,
    /// Committed cache, step index -> variable -> value
    #[serde(default)]
    pub cache: BTreeMap<usize, BTreeMap<String, JsonValue>>,
}
