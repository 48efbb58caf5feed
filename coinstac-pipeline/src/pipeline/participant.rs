//! Participant side of a decentralized step
//!
//! Each iteration the participant runs its local computation, publishes the
//! result and waits for the aggregator's answer, which becomes the input of
//! its next iteration and, once complete, the step's output.
//!
//! The aggregator answers only after it gathered the group, which can take
//! a whole peer timeout, and ran its own computation. A participant
//! therefore waits two peer timeouts for the answer.

use coinstac_core::domain::run::{RunMode, RunStatus};
use coinstac_core::dto::transport::{LocalResult, RemoteResult, TransferredFile, TransportMessage};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::inbox::Inbox;
use super::state::StepState;
use super::step::{StepResult, StepRunner};
use crate::controller::{Controller, Decision, DecentralizedController};
use crate::driver::ComputationOutput;
use crate::error::{PipelineError, Result};
use crate::transport::files;

impl StepRunner<'_> {
    pub async fn run_participant(&mut self, mut state: StepState, inbox: &mut Inbox) -> Result<StepResult> {
        let step = self.step;
        let options = &step.controller.options;
        let controller = DecentralizedController::new(RunMode::Local, options);
        let answer_window = self.ctx.peer_timeout_for(options.timeout_ms) * 2;

        loop {
            if controller.pre_iteration(&state) == Decision::Done {
                break;
            }

            let boundary = state.checkpoint(self.ctx.mode);
            let hooks = self
                .plugins
                .pre_run_local(state.last_remote.as_ref(), &mut state.plugin_state);
            if hooks.save_requested() {
                self.control.save_checkpoint(boundary);
            }

            let latest = if hooks.run_cancelled() {
                debug!(
                    "Run {} step {}: already contributed, waiting for the group",
                    self.ctx.run_id, self.index
                );
                ComputationOutput::unfinished(JsonValue::Null)
            } else {
                state.iteration += 1;
                self.report(&state, RunStatus::Running, vec![]);
                self.contribute(&controller, &mut state).await?
            };

            self.report(&state, RunStatus::WaitingForPeers, vec![]);
            let mut remote = self.await_remote(inbox, state.iteration, answer_window).await?;

            let decision = controller.decide(&state, &latest, Some(&remote));
            debug!(
                "Run {} step {} iteration {}: {:?}",
                self.ctx.run_id, self.index, state.iteration, decision
            );

            if let Decision::Cancel(reason) = decision {
                return Err(PipelineError::container(reason));
            }

            // Final results go to the user, the rest feeds the next iteration
            let received = std::mem::take(&mut remote.files);
            let target = if remote.complete {
                &self.ctx.directories.output
            } else {
                &self.ctx.directories.input
            };
            files::unpack(&received, target).await?;

            self.stage(&remote.data)?;
            let mut aggregate = if remote.complete {
                ComputationOutput::finished(remote.data.clone())
            } else {
                ComputationOutput::unfinished(remote.data.clone())
            };
            aggregate.cache = latest.cache;
            state.absorb(aggregate);
            state.last_remote = Some(remote);
            self.control.save_checkpoint(state.checkpoint(self.ctx.mode));
            self.report(&state, RunStatus::Running, vec![]);

            match decision {
                Decision::Done => break,
                Decision::Repeat => continue,
                other => return Err(self.unexpected(&other)),
            }
        }

        Ok(StepResult::from_state(&state))
    }

    /// Runs the local computation and sends its result to the aggregator
    async fn contribute(
        &mut self,
        controller: &DecentralizedController,
        state: &mut StepState,
    ) -> Result<ComputationOutput> {
        let (latest, error) = match self.invoke(state).await {
            Ok(output) => (output, None),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if controller.tolerates_user_errors() => {
                warn!(
                    "Run {} step {} iteration {}: computation failed, continuing: {}",
                    self.ctx.run_id, self.index, state.iteration, e
                );
                (ComputationOutput::unfinished(JsonValue::Null), Some(e.to_string()))
            }
            Err(e) => {
                // Let the aggregator fail the others fast
                let report = self.local_result(state, JsonValue::Null, Some(e.to_string()), vec![]);
                if let Err(publish_err) = self.publish(report).await {
                    warn!("Failed to report computation failure: {}", publish_err);
                }
                return Err(e);
            }
        };

        let outgoing = files::drain(&self.ctx.directories.transfer).await?;
        let message = self.local_result(state, latest.data.clone(), error, outgoing);
        self.publish(message).await?;
        Ok(latest)
    }

    fn local_result(
        &self,
        state: &StepState,
        data: JsonValue,
        error: Option<String>,
        files: Vec<TransferredFile>,
    ) -> TransportMessage {
        TransportMessage::Local(LocalResult {
            username: self.ctx.client_id.clone(),
            run_id: self.ctx.run_id.clone(),
            step: self.index,
            iteration: state.iteration,
            data,
            plugin_state: state.plugin_state.clone(),
            error,
            files,
        })
    }

    /// Waits for the aggregator's answer to `iteration`
    ///
    /// Older answers are duplicates and get dropped. Failure notices are
    /// accepted whatever their iteration.
    async fn await_remote(&self, inbox: &mut Inbox, iteration: u32, timeout: Duration) -> Result<RemoteResult> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let received = tokio::select! {
                _ = self.control.stopped() => return Err(self.control.stop_error()),
                received = tokio::time::timeout_at(deadline, inbox.next(self.index)) => received,
            };

            match received {
                Err(_) => {
                    return Err(PipelineError::Timeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                        waiting_on: "aggregator".to_string(),
                    });
                }
                Ok(None) => {
                    return Err(PipelineError::Transport(format!(
                        "subscription for run {} closed",
                        self.ctx.run_id
                    )));
                }
                Ok(Some(TransportMessage::Remote(remote))) => {
                    if remote.error.is_some() || remote.iteration >= iteration {
                        return Ok(remote);
                    }
                    warn!(
                        "Dropping duplicate aggregator result for iteration {} (waiting for {})",
                        remote.iteration, iteration
                    );
                }
                Ok(Some(TransportMessage::Local(other))) => {
                    debug!("Ignoring participant message from {}", other.username);
                }
            }
        }
    }
}
