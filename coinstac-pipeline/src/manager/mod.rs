//! Pipeline manager
//!
//! The process-wide registry of active runs on one node. It validates and
//! starts runs, hands out their progress streams, stops and suspends them,
//! and cleans up after them once they are terminal.

mod request;

pub use request::{ManagerState, RunHandle, RunResult, ShutdownMode, StartRequest};

use chrono::Utc;
use coinstac_core::domain::run::RunStatus;
use coinstac_core::dto::state::{PipelineOutput, StateEvent, SuspendedRun, TerminalEvent, TerminalStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::context::{RunContext, RunDirectories};
use crate::driver::ContainerDriver;
use crate::error::{PipelineError, Result};
use crate::pipeline::{Pipeline, RunControl};
use crate::transport::Transport;
use crate::validation::validate_request;

#[derive(Clone)]
pub struct PipelineManager {
    config: Arc<ManagerConfig>,
    driver: Arc<dyn ContainerDriver>,
    transport: Arc<dyn Transport>,
    active: Arc<Mutex<HashMap<String, RunControl>>>,
    closed: Arc<AtomicBool>,
}

impl PipelineManager {
    /// Creates a manager bound to `config`'s node
    ///
    /// Fails with [`PipelineError::Config`] when the configuration is
    /// invalid or the operating directory is not writable.
    pub async fn create(
        config: ManagerConfig,
        driver: Arc<dyn ContainerDriver>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        ensure_writable(&config.operating_directory, &config.client_id).await?;

        info!(
            "Pipeline manager ready: {} node '{}' in {}",
            config.mode,
            config.client_id,
            config.operating_directory.display()
        );

        Ok(Self {
            config: Arc::new(config),
            driver,
            transport,
            active: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, RunControl>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, run_id: &str) -> Result<RunControl> {
        self.registry()
            .get(run_id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(run_id.to_string()))
    }

    fn unregister(&self, run_id: &str) {
        if self.registry().remove(run_id).is_some() {
            debug!("Run {} unregistered", run_id);
        }
    }

    /// Validates and starts a run
    ///
    /// Validation and duplicate ids are reported here, before anything
    /// runs. Everything else surfaces through the handle's result.
    pub async fn start_pipeline(&self, request: StartRequest) -> Result<RunHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Config("manager is shut down".to_string()));
        }
        validate_request(&request, self.config.mode)?;

        let StartRequest {
            spec,
            run_id,
            clients,
            timeout,
            file_listings,
            saved_state,
        } = request;

        let control = RunControl::new(run_id.clone(), self.config.mode, self.config.state_buffer);
        let states = control.subscribe();
        {
            let mut active = self.registry();
            if active.contains_key(&run_id) {
                return Err(PipelineError::DuplicateRun(run_id));
            }
            active.insert(run_id.clone(), control.clone());
        }

        let directories = RunDirectories::new(
            &self.config.operating_directory,
            &self.config.client_id,
            &run_id,
        );
        if let Err(e) = directories.create().await {
            self.unregister(&run_id);
            return Err(e);
        }

        let ctx = RunContext {
            run_id: run_id.clone(),
            client_id: self.config.client_id.clone(),
            mode: self.config.mode,
            clients,
            directories: directories.clone(),
            file_listings,
            peer_timeout: timeout.unwrap_or(self.config.peer_timeout),
        };

        let mut pipeline = Pipeline::new(
            Arc::new(spec),
            ctx,
            Arc::clone(&self.driver),
            Arc::clone(&self.transport),
            control.clone(),
        )
        .with_image_pull(self.config.pull_images);
        if let Some(saved) = saved_state {
            info!("Run {} resuming at step {}", run_id, saved.current_step);
            pipeline = pipeline.with_saved_state(saved);
        }

        info!("Run {} registered", run_id);
        let manager = self.clone();
        let supervised_id = run_id.clone();
        let handle = tokio::spawn(async move {
            manager
                .supervise(supervised_id, pipeline, control, directories)
                .await
        });

        Ok(RunHandle {
            run_id,
            result: RunResult::new(handle),
            states,
        })
    }

    /// Runs the pipeline and finalizes it whatever the outcome
    async fn supervise(
        self,
        run_id: String,
        pipeline: Pipeline,
        control: RunControl,
        directories: RunDirectories,
    ) -> Result<PipelineOutput> {
        let result = match tokio::spawn(pipeline.run()).await {
            Ok(result) => result,
            Err(e) => {
                error!("Run {} task died: {}", run_id, e);
                Err(PipelineError::Internal(format!("run task died: {}", e)))
            }
        };

        let (status, terminal, output) = match &result {
            Ok(output) => (RunStatus::Completed, TerminalStatus::Complete, Some(output.output.clone())),
            Err(e) if e.is_cancelled() => (RunStatus::Cancelled, TerminalStatus::Cancelled, None),
            Err(_) => (RunStatus::Failed, TerminalStatus::Error, None),
        };
        control.mark_terminal(status, output);

        directories.remove_scratch().await;
        self.unregister(&run_id);

        let detail = match &result {
            Ok(output) => serde_json::to_value(output).unwrap_or_else(|_| output.output.clone()),
            Err(e) => e.to_detail(),
        };
        info!("Run {} finished: {}", run_id, terminal);
        control.finish(TerminalEvent {
            run_id,
            status: terminal,
            detail,
        });

        result
    }

    /// Stops a run and waits until it is terminal
    pub async fn stop_pipeline(&self, run_id: &str, reason: impl Into<String>) -> Result<()> {
        let control = self.lookup(run_id)?;
        let reason = reason.into();
        info!("Stopping run {}: {}", run_id, reason);

        control.request_stop(reason);
        control.wait_finished().await;
        Ok(())
    }

    /// Stops a run, keeping what is needed to resume it later
    ///
    /// Fails with [`PipelineError::NotFound`] if the run completed before
    /// it could be stopped.
    pub async fn suspend_pipeline(&self, run_id: &str) -> Result<SuspendedRun> {
        let control = self.lookup(run_id)?;
        info!("Suspending run {}", run_id);

        control.request_stop("suspend");
        control.wait_finished().await;

        if control.snapshot().status == RunStatus::Completed {
            return Err(PipelineError::NotFound(run_id.to_string()));
        }
        Ok(control.suspended())
    }

    /// Snapshot of every active run
    pub fn get_pipeline_states(&self) -> ManagerState {
        let active_pipelines = self
            .registry()
            .iter()
            .map(|(run_id, control)| (run_id.clone(), control.snapshot()))
            .collect();
        ManagerState { active_pipelines }
    }

    /// Progress events of an active run from now on
    pub fn subscribe(&self, run_id: &str) -> Result<broadcast::Receiver<StateEvent>> {
        Ok(self.lookup(run_id)?.subscribe())
    }

    /// Participants the run is waiting on, empty unless it is waiting
    pub fn waiting_on(&self, run_id: &str) -> Result<Vec<String>> {
        Ok(self.lookup(run_id)?.snapshot().waiting_on)
    }

    /// Releases every run and closes the transport
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let runs: Vec<RunControl> = self.registry().values().cloned().collect();
        info!(
            "Shutting down manager '{}' ({:?}, {} active run(s))",
            self.config.client_id,
            mode,
            runs.len()
        );

        if mode == ShutdownMode::Force {
            for run in &runs {
                run.request_stop("manager shutdown");
            }
        }
        for run in &runs {
            run.wait_finished().await;
        }

        self.transport.close().await
    }
}

/// Creates the operating directory and checks a file can be written to it
async fn ensure_writable(dir: &Path, client_id: &str) -> Result<()> {
    let unusable = |e: std::io::Error| {
        PipelineError::Config(format!(
            "Operating directory {} is not writable: {}",
            dir.display(),
            e
        ))
    };

    tokio::fs::create_dir_all(dir).await.map_err(unusable)?;
    let marker = dir.join(format!(
        ".write-check-{}-{}",
        client_id,
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    tokio::fs::write(&marker, b"coinstac").await.map_err(unusable)?;
    if let Err(e) = tokio::fs::remove_file(&marker).await {
        warn!("Failed to remove write check {}: {}", marker.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ComputationOutput, Invocation};
    use crate::transport::MemoryBroker;
    use async_trait::async_trait;
    use coinstac_core::domain::run::RunMode;
    use tokio_util::sync::CancellationToken;

    struct NoopDriver;

    #[async_trait]
    impl ContainerDriver for NoopDriver {
        async fn run(&self, _invocation: Invocation, _cancel: CancellationToken) -> Result<ComputationOutput> {
            Ok(ComputationOutput::finished(serde_json::json!({})))
        }

        async fn pull_images(&self, _images: &[String]) -> Result<()> {
            Ok(())
        }
    }

    async fn manager(dir: &Path) -> Result<PipelineManager> {
        let broker = MemoryBroker::new();
        PipelineManager::create(
            ManagerConfig::new(RunMode::Local, "alice", dir),
            Arc::new(NoopDriver),
            Arc::new(broker.transport("alice", RunMode::Local)),
        )
        .await
    }

    #[tokio::test]
    async fn test_create_checks_operating_directory_is_writable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(manager(&dir.path().join("nested")).await.is_ok());

        let file = dir.path().join("plain-file");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(manager(&file).await, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await.unwrap();

        assert_eq!(
            manager.stop_pipeline("nope", "user").await,
            Err(PipelineError::NotFound("nope".to_string()))
        );
        assert!(manager.subscribe("nope").is_err());
        assert!(manager.get_pipeline_states().active_pipelines.is_empty());
    }

    #[tokio::test]
    async fn test_start_refused_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await.unwrap();
        manager.shutdown(ShutdownMode::Graceful).await.unwrap();

        let spec = serde_json::from_value(serde_json::json!({
            "steps": [{
                "controller": { "type": "local" },
                "computations": [{
                    "meta": { "id": "a", "name": "a", "description": "a", "repository": "r", "version": "1" },
                    "computation": { "type": "cmd", "command": ["true"] }
                }]
            }]
        }))
        .unwrap();
        let result = manager.start_pipeline(StartRequest::new(spec, "run-1")).await;
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
