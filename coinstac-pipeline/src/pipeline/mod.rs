//! Pipeline run instance
//!
//! A [`Pipeline`] executes the steps of one specification in order. Each
//! step resolves its inputs, runs the loop its controller and the node's
//! mode call for, and commits its declared outputs to the run's cache
//! before the next step starts.

mod aggregator;
pub mod control;
pub mod inbox;
pub mod inputs;
mod local;
mod participant;
pub mod state;
pub mod step;

pub use control::RunControl;
pub use inbox::Inbox;
pub use state::StepState;
pub use step::{StepResult, StepRunner};

use chrono::Utc;
use coinstac_core::domain::computation::VariableSpec;
use coinstac_core::domain::pipeline::{ControllerType, PipelineSpec, PluginKind, Step};
use coinstac_core::domain::run::{RunMode, RunStatus};
use coinstac_core::dto::state::{PipelineOutput, StepCheckpoint, StepSummary, SuspendedRun};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::context::RunContext;
use crate::driver::ContainerDriver;
use crate::error::{PipelineError, Result};
use crate::plugin::PluginSet;
use crate::transport::Transport;

/// One run of a pipeline specification on this node
pub struct Pipeline {
    spec: Arc<PipelineSpec>,
    ctx: RunContext,
    driver: Arc<dyn ContainerDriver>,
    transport: Arc<dyn Transport>,
    control: RunControl,
    cache: Cache,
    start_step: usize,
    resume: Option<StepCheckpoint>,
    pull_images: bool,
}

impl Pipeline {
    pub fn new(
        spec: Arc<PipelineSpec>,
        ctx: RunContext,
        driver: Arc<dyn ContainerDriver>,
        transport: Arc<dyn Transport>,
        control: RunControl,
    ) -> Self {
        Self {
            spec,
            ctx,
            driver,
            transport,
            control,
            cache: Cache::new(),
            start_step: 0,
            resume: None,
            pull_images: false,
        }
    }

    /// Pulls every image the run needs before the first step
    pub fn with_image_pull(mut self, enabled: bool) -> Self {
        self.pull_images = enabled;
        self
    }

    /// Continues a suspended run: committed outputs are restored, finished
    /// steps are skipped and the current step picks up at its checkpoint
    pub fn with_saved_state(mut self, saved: SuspendedRun) -> Self {
        self.cache = Cache::restore(saved.cache);
        self.start_step = saved.current_step;
        self.resume = saved.checkpoint.filter(|c| c.step == saved.current_step);

        self.control.record_commit(self.cache.snapshot());
        if let Some(checkpoint) = &self.resume {
            self.control.save_checkpoint(checkpoint.clone());
        }
        let start_step = self.start_step;
        let summary = self.cache.summary();
        self.control.update(|s| {
            s.step = start_step;
            s.cache = summary;
        });
        self
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Runs the pipeline to its end
    ///
    /// On any error staged outputs are discarded; only what earlier steps
    /// committed stays in the cache.
    pub async fn run(mut self) -> Result<PipelineOutput> {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_id = self.ctx.run_id.clone();

        info!(
            "Starting run {} as {} node '{}' ({} step(s), from step {})",
            run_id,
            self.ctx.mode,
            self.ctx.client_id,
            self.spec.steps.len(),
            self.start_step
        );
        self.control.update(|s| s.status = RunStatus::Running);

        let result = self.execute().await;
        match result {
            Ok((output, steps)) => {
                let finished_at = Utc::now();
                info!("Run {} completed in {:?}", run_id, started.elapsed());
                Ok(PipelineOutput {
                    run_id,
                    output,
                    steps,
                    started_at,
                    finished_at,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                self.cache.discard_all();
                if e.is_cancelled() {
                    info!("Run {} cancelled: {}", run_id, e);
                } else {
                    warn!("Run {} failed: {}", run_id, e);
                }
                Err(e)
            }
        }
    }

    async fn execute(&mut self) -> Result<(JsonValue, Vec<StepSummary>)> {
        if self.pull_images {
            self.pull().await?;
        }

        let mut inbox = if self.spec.is_decentralized() {
            let subscription = self.transport.subscribe(&self.ctx.run_id).await?;
            Some(Inbox::new(subscription))
        } else {
            None
        };

        let result = self.run_steps(&mut inbox).await;

        if inbox.is_some() {
            if let Err(e) = self.transport.unsubscribe(&self.ctx.run_id).await {
                warn!("Failed to unsubscribe run {}: {}", self.ctx.run_id, e);
            }
        }
        result
    }

    async fn pull(&self) -> Result<()> {
        let images = self.spec.images_for(self.ctx.mode);
        if images.is_empty() {
            return Ok(());
        }

        info!("Pulling {} image(s) for run {}", images.len(), self.ctx.run_id);
        tokio::select! {
            _ = self.control.stopped() => Err(self.control.stop_error()),
            pulled = self.driver.pull_images(&images) => pulled,
        }
    }

    async fn run_steps(&mut self, inbox: &mut Option<Inbox>) -> Result<(JsonValue, Vec<StepSummary>)> {
        let spec = Arc::clone(&self.spec);
        let mode = self.ctx.mode;
        let mut output = JsonValue::Object(Map::new());
        let mut summaries = Vec::with_capacity(spec.steps.len());

        for (index, step) in spec.steps.iter().enumerate().skip(self.start_step) {
            if self.control.is_stopping() {
                return Err(self.control.stop_error());
            }

            let step_started = Instant::now();
            let computation = step.computation().ok_or_else(|| {
                PipelineError::Validation(format!("step {} has no computation", index))
            })?;
            let controller_type = step.controller.resolved_type().ok_or_else(|| {
                PipelineError::Validation(format!("step {} has no controller type", index))
            })?;
            // Local steps never reach the aggregator
            let skipped = mode == RunMode::Remote && controller_type == ControllerType::Local;

            let state = self.initial_state(step, index)?;
            let id = step.id.clone();
            let iteration = state.iteration;
            self.control.update(|s| {
                s.step = index;
                s.step_id = id;
                s.iteration = iteration;
                s.waiting_on.clear();
            });

            let mut runner = StepRunner {
                ctx: &self.ctx,
                driver: self.driver.as_ref(),
                transport: self.transport.as_ref(),
                control: &self.control,
                cache: &mut self.cache,
                step,
                computation,
                index,
                plugins: PluginSet::from_kinds(&step.controller.options.plugins),
            };

            let result = if skipped {
                debug!("Run {} step {}: local step, nothing to aggregate", self.ctx.run_id, index);
                StepResult {
                    output: None,
                    iterations: 0,
                }
            } else {
                match (mode, controller_type) {
                    (RunMode::Local, ControllerType::Local) => runner.run_local(state).await?,
                    (RunMode::Local, ControllerType::Decentralized) => {
                        runner.run_participant(state, subscribed(inbox)?).await?
                    }
                    (RunMode::Remote, _) => runner.run_aggregator(state, subscribed(inbox)?).await?,
                }
            };

            let step_output = if skipped {
                json!({})
            } else {
                inputs::enforce_output_contract(index, &computation.computation.output, result.output)?
            };
            self.commit(index, &computation.computation.output, &step_output)?;

            info!(
                "Run {} step {} ({}) done after {} iteration(s)",
                self.ctx.run_id,
                index,
                label(step, index),
                result.iterations
            );
            summaries.push(StepSummary {
                id: label(step, index),
                iterations: result.iterations,
                duration_ms: step_started.elapsed().as_millis() as u64,
            });
            output = step_output;
        }

        Ok((output, summaries))
    }

    /// State the step starts from: its checkpoint when resuming, otherwise
    /// its resolved inputs
    fn initial_state(&mut self, step: &Step, index: usize) -> Result<StepState> {
        if let Some(checkpoint) = self.resume.take_if(|c| c.step == index) {
            info!(
                "Run {} step {}: resuming at iteration {}",
                self.ctx.run_id, index, checkpoint.iteration
            );
            let group_step = step.controller.options.plugins.contains(&PluginKind::GroupStep);
            return Ok(StepState::resume(&checkpoint, self.ctx.mode, group_step));
        }

        // The aggregator's input is built from contributions each round
        let input = match self.ctx.mode {
            RunMode::Local => inputs::resolve(step, index, &self.cache, &self.ctx.file_listings)?,
            RunMode::Remote => json!({}),
        };
        Ok(StepState::new(index, input))
    }

    /// Writes the step's final declared outputs and commits them
    fn commit(
        &mut self,
        index: usize,
        declared: &BTreeMap<String, VariableSpec>,
        output: &JsonValue,
    ) -> Result<()> {
        if let Some(object) = output.as_object() {
            for name in declared.keys() {
                if let Some(value) = object.get(name) {
                    self.cache
                        .put(index, name.clone(), value.clone())
                        .map_err(|e| PipelineError::Internal(e.to_string()))?;
                }
            }
        }
        self.cache
            .commit(index)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;

        self.control.record_commit(self.cache.snapshot());
        let summary = self.cache.summary();
        self.control.update(|s| s.cache = summary);
        Ok(())
    }
}

fn subscribed(inbox: &mut Option<Inbox>) -> Result<&mut Inbox> {
    inbox
        .as_mut()
        .ok_or_else(|| PipelineError::Internal("decentralized step without a subscription".to_string()))
}

fn label(step: &Step, index: usize) -> String {
    if step.id.is_empty() {
        format!("step-{}", index)
    } else {
        step.id.clone()
    }
}
