//! Execution of a single step
//!
//! [`StepRunner`] carries what every step loop needs. The loops themselves
//! live in `local`, `participant` and `aggregator`.

use coinstac_core::domain::computation::ComputationDefinition;
use coinstac_core::domain::pipeline::Step;
use coinstac_core::domain::run::RunStatus;
use coinstac_core::dto::transport::TransportMessage;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::control::RunControl;
use super::state::StepState;
use crate::cache::Cache;
use crate::context::RunContext;
use crate::driver::{ComputationOutput, ContainerDriver, Invocation};
use crate::error::{PipelineError, Result};
use crate::plugin::PluginSet;
use crate::transport::Transport;

/// How a step ended
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Final output, `None` when the computation never ran
    pub output: Option<JsonValue>,
    pub iterations: u32,
}

impl StepResult {
    pub fn from_state(state: &StepState) -> Self {
        Self {
            output: state.latest_data().cloned(),
            iterations: state.iteration,
        }
    }
}

pub struct StepRunner<'a> {
    pub ctx: &'a RunContext,
    pub driver: &'a dyn ContainerDriver,
    pub transport: &'a dyn Transport,
    pub control: &'a RunControl,
    pub cache: &'a mut Cache,
    pub step: &'a Step,
    pub computation: &'a ComputationDefinition,
    pub index: usize,
    pub plugins: PluginSet,
}

impl StepRunner<'_> {
    /// Runs the step's computation once on `state.next_input`
    pub async fn invoke(&self, state: &StepState) -> Result<ComputationOutput> {
        if self.control.is_stopping() {
            return Err(self.control.stop_error());
        }

        let invocation = Invocation {
            run_id: self.ctx.run_id.clone(),
            client_id: self.ctx.client_id.clone(),
            mode: self.ctx.mode,
            step: self.index,
            iteration: state.iteration,
            kind: self.computation.kind_for(self.ctx.mode).clone(),
            input: state.next_input.clone(),
            cache: state.computation_cache.clone(),
            directories: self.ctx.directories.clone(),
        };

        match self
            .driver
            .run(invocation, self.control.stop_token().clone())
            .await
        {
            Err(e) if e.is_cancelled() || self.control.is_stopping() => Err(self.control.stop_error()),
            Err(e) => Err(e),
            Ok(_) if self.control.is_stopping() => Err(self.control.stop_error()),
            Ok(mut output) => {
                output.data = self.plugins.post_run(output.data, &state.plugin_state);
                Ok(output)
            }
        }
    }

    /// Stages the declared outputs present in `data` as this step's
    /// tentative values
    pub fn stage(&mut self, data: &JsonValue) -> Result<()> {
        let Some(object) = data.as_object() else {
            return Ok(());
        };

        for name in self.computation.computation.output.keys() {
            if let Some(value) = object.get(name) {
                self.cache
                    .put(self.index, name.clone(), value.clone())
                    .map_err(|e| PipelineError::Internal(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub async fn publish(&self, message: TransportMessage) -> Result<()> {
        debug!(
            "Publishing {} message for run {} step {} iteration {}",
            match &message {
                TransportMessage::Local(_) => "local",
                TransportMessage::Remote(_) => "remote",
            },
            self.ctx.run_id,
            self.index,
            message.iteration()
        );
        self.transport.publish(&self.ctx.run_id, message).await
    }

    /// Publishes a snapshot of the step's progress
    pub fn report(&self, state: &StepState, status: RunStatus, waiting_on: Vec<String>) {
        let summary = self.cache.summary();
        let output = state.latest_data().cloned();
        self.control.update(|snapshot| {
            snapshot.status = status;
            snapshot.step = self.index;
            snapshot.step_id = self.step.id.clone();
            snapshot.iteration = state.iteration;
            snapshot.waiting_on = waiting_on;
            snapshot.cache = summary;
            if output.is_some() {
                snapshot.output = output;
            }
        });
    }

    /// Maps a decision the loop cannot act on
    pub fn unexpected(&self, decision: &crate::controller::Decision) -> PipelineError {
        PipelineError::Internal(format!(
            "step {} got unexpected decision {:?}",
            self.index, decision
        ))
    }
}
