//! Shared control block of a run
//!
//! Held by the run task and by the manager's registry. The run writes its
//! progress here; the manager reads snapshots, requests stops and waits for
//! the run to finish.

use chrono::Utc;
use coinstac_core::domain::run::{RunMode, RunStatus};
use coinstac_core::dto::state::{StateEvent, StateSnapshot, StepCheckpoint, SuspendedRun, TerminalEvent};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PipelineError;

struct Inner {
    run_id: String,
    snapshot: watch::Sender<StateSnapshot>,
    events: broadcast::Sender<StateEvent>,
    stop: CancellationToken,
    stop_reason: Mutex<Option<String>>,
    finished: CancellationToken,
    terminal_sent: AtomicBool,
    checkpoint: Mutex<Option<StepCheckpoint>>,
    committed: Mutex<BTreeMap<usize, BTreeMap<String, JsonValue>>>,
}

#[derive(Clone)]
pub struct RunControl {
    inner: Arc<Inner>,
}

impl RunControl {
    /// `capacity` bounds the event channel; slow subscribers lag, the run
    /// never waits for them
    pub fn new(run_id: impl Into<String>, mode: RunMode, capacity: usize) -> Self {
        let run_id = run_id.into();
        let (snapshot, _) = watch::channel(StateSnapshot::pending(run_id.clone(), mode));
        let (events, _) = broadcast::channel(capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                run_id,
                snapshot,
                events,
                stop: CancellationToken::new(),
                stop_reason: Mutex::new(None),
                finished: CancellationToken::new(),
                terminal_sent: AtomicBool::new(false),
                checkpoint: Mutex::new(None),
                committed: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Applies `change` to the current snapshot and publishes it
    pub fn update(&self, change: impl FnOnce(&mut StateSnapshot)) {
        let mut published = None;
        self.inner.snapshot.send_modify(|snapshot| {
            change(snapshot);
            snapshot.timestamp = Utc::now();
            published = Some(snapshot.clone());
        });
        if let Some(snapshot) = published {
            // No subscribers is fine
            let _ = self.inner.events.send(StateEvent::Update(snapshot));
        }
    }

    /// Asks the run to stop at its next suspension point
    ///
    /// The first reason wins.
    pub fn request_stop(&self, reason: impl Into<String>) {
        {
            let mut stored = self.inner.stop_reason.lock().unwrap_or_else(|e| e.into_inner());
            if stored.is_none() {
                *stored = Some(reason.into());
            }
        }
        self.inner.stop.cancel();
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.inner.stop
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.inner.stop.cancelled().await
    }

    /// The error a stopped run ends with
    pub fn stop_error(&self) -> PipelineError {
        let reason = self
            .inner
            .stop_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "stopped".to_string());
        PipelineError::cancelled(reason)
    }

    pub fn save_checkpoint(&self, checkpoint: StepCheckpoint) {
        debug!(
            "Checkpoint for run {} at step {} iteration {}",
            self.inner.run_id, checkpoint.step, checkpoint.iteration
        );
        *self.inner.checkpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(checkpoint);
    }

    /// Records what the cache has committed so far, drops the checkpoint of
    /// the step that just finished
    pub fn record_commit(&self, committed: BTreeMap<usize, BTreeMap<String, JsonValue>>) {
        *self.inner.committed.lock().unwrap_or_else(|e| e.into_inner()) = committed;
        *self.inner.checkpoint.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Resumable state as of now
    ///
    /// The current step is the one after the last committed step when the
    /// snapshot has not moved on yet.
    pub fn suspended(&self) -> SuspendedRun {
        let cache = self
            .inner
            .committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let after_commits = cache.keys().next_back().map_or(0, |step| step + 1);
        let current_step = self.inner.snapshot.borrow().step.max(after_commits);

        let checkpoint = self
            .inner
            .checkpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|c| c.step == current_step);

        SuspendedRun {
            run_id: self.inner.run_id.clone(),
            current_step,
            checkpoint,
            cache,
        }
    }

    /// Moves the snapshot to its final status
    pub fn mark_terminal(&self, status: RunStatus, output: Option<JsonValue>) {
        self.update(|snapshot| {
            snapshot.status = status;
            snapshot.waiting_on.clear();
            if output.is_some() {
                snapshot.output = output;
            }
        });
    }

    /// Sends the terminal event, at most once, and releases waiters
    pub fn finish(&self, event: TerminalEvent) {
        if !self.inner.terminal_sent.swap(true, Ordering::SeqCst) {
            let _ = self.inner.events.send(StateEvent::Terminal(event));
        }
        self.inner.finished.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.is_cancelled()
    }

    /// Resolves once the run has been finalized and unregistered
    pub async fn wait_finished(&self) {
        self.inner.finished.cancelled().await
    }
}
