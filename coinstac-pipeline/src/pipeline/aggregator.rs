//! Aggregator side of a decentralized step
//!
//! Each round the aggregator collects one contribution per expected
//! participant at the group's current counter, runs the remote computation
//! over them and answers every participant with the result. Files a
//! participant ships land in `<input>/<username>`.

use coinstac_core::domain::run::{RunMode, RunStatus};
use coinstac_core::dto::transport::{LocalResult, RemoteResult, TransportMessage, UserResult};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::inbox::Inbox;
use super::state::StepState;
use super::step::{StepResult, StepRunner};
use crate::controller::{Controller, Decision, DecentralizedController};
use crate::error::{PipelineError, Result};
use crate::transport::files;

/// Contributions received ahead of their round, counter -> user -> result
type Held = BTreeMap<u32, BTreeMap<String, LocalResult>>;

impl StepRunner<'_> {
    pub async fn run_aggregator(&mut self, mut state: StepState, inbox: &mut Inbox) -> Result<StepResult> {
        let step = self.step;
        let controller = DecentralizedController::new(RunMode::Remote, &step.controller.options);
        let timeout = self.ctx.peer_timeout_for(step.controller.options.timeout_ms);

        let result = self.aggregate(&controller, &mut state, inbox, timeout).await;
        if let Err(e) = &result {
            self.notify_failure(&state, e).await;
        }
        result
    }

    async fn aggregate(
        &mut self,
        controller: &DecentralizedController,
        state: &mut StepState,
        inbox: &mut Inbox,
        timeout: Duration,
    ) -> Result<StepResult> {
        let mut held = Held::new();

        loop {
            if controller.pre_iteration(state) == Decision::Done {
                break;
            }

            let user_results = self.collect(controller, state, inbox, timeout, &mut held).await?;
            state.sync.bump();
            state.iteration += 1;

            let boundary = state.checkpoint(RunMode::Remote);
            let hooks = self.plugins.pre_run_remote(&state.sync, &mut state.plugin_state);
            if hooks.save_requested() {
                self.control.save_checkpoint(boundary);
            }

            state.next_input = json!({
                "usernames": self.ctx.clients,
                "userResults": user_results,
                "pluginState": state.plugin_state,
                "iteration": state.iteration,
            });
            self.report(state, RunStatus::Running, vec![]);

            let output = self.invoke(state).await?;
            self.stage(&output.data)?;
            let outgoing = files::drain(&self.ctx.directories.transfer).await?;

            let decision = controller.decide(state, &output, None);
            debug!(
                "Run {} step {} round {}: {:?}",
                self.ctx.run_id, self.index, state.iteration, decision
            );
            if let Decision::Cancel(reason) = decision {
                return Err(PipelineError::container(reason));
            }

            self.publish(TransportMessage::Remote(RemoteResult {
                run_id: self.ctx.run_id.clone(),
                step: self.index,
                iteration: state.iteration,
                usernames: self.ctx.clients.clone(),
                user_results,
                data: output.data.clone(),
                plugin_state: state.plugin_state.clone(),
                complete: decision == Decision::Done,
                error: None,
                files: outgoing,
            }))
            .await?;

            state.absorb(output);
            self.control.save_checkpoint(state.checkpoint(RunMode::Remote));
            self.report(state, RunStatus::Running, vec![]);

            match decision {
                Decision::Done => break,
                Decision::Repeat => continue,
                other => return Err(self.unexpected(&other)),
            }
        }

        Ok(StepResult::from_state(state))
    }

    /// Waits until every expected participant contributed at the current
    /// counter and returns their results in participant order
    ///
    /// Errored contributions count as present but are left out of the
    /// results.
    async fn collect(
        &self,
        controller: &DecentralizedController,
        state: &mut StepState,
        inbox: &mut Inbox,
        timeout: Duration,
        held: &mut Held,
    ) -> Result<Vec<UserResult>> {
        let expected = &self.ctx.clients;
        let started = Instant::now();
        let deadline = started + timeout;

        while !state.sync.is_ready(expected) {
            self.report(state, RunStatus::WaitingForPeers, state.sync.missing(expected));

            let received = tokio::select! {
                _ = self.control.stopped() => return Err(self.control.stop_error()),
                received = tokio::time::timeout_at(deadline, inbox.next(self.index)) => received,
            };

            let mut result = match received {
                Err(_) => {
                    let missing = state.sync.missing(expected);
                    if controller.tolerates_timeout() && state.sync.has_contributions() {
                        warn!(
                            "Run {} step {}: continuing without {}",
                            self.ctx.run_id,
                            self.index,
                            missing.join(", ")
                        );
                        break;
                    }
                    return Err(PipelineError::Timeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                        waiting_on: missing.join(", "),
                    });
                }
                Ok(None) => {
                    return Err(PipelineError::Transport(format!(
                        "subscription for run {} closed",
                        self.ctx.run_id
                    )));
                }
                Ok(Some(TransportMessage::Remote(_))) => {
                    debug!("Ignoring aggregator message on run {}", self.ctx.run_id);
                    continue;
                }
                Ok(Some(TransportMessage::Local(result))) => result,
            };

            if !expected.contains(&result.username) {
                warn!(
                    "Ignoring contribution from unexpected participant {} on run {}",
                    result.username, self.ctx.run_id
                );
                continue;
            }

            let counter = controller.counter(&result);
            let fresh = counter >= state.sync.step()
                && !held
                    .get(&counter)
                    .is_some_and(|users| users.contains_key(&result.username));

            match controller.on_contribution(&mut state.sync, &result, expected) {
                Decision::Cancel(reason) => return Err(PipelineError::container(reason)),
                decision => {
                    if fresh {
                        let shipped = std::mem::take(&mut result.files);
                        let dir = files::contributor_dir(&self.ctx.directories.input, &result.username)?;
                        files::unpack(&shipped, &dir).await?;
                        held.entry(counter)
                            .or_default()
                            .insert(result.username.clone(), result);
                    }
                    if decision == Decision::Advance {
                        break;
                    }
                }
            }
        }

        let current = state.sync.step();
        let round = held.remove(&current).unwrap_or_default();
        held.retain(|counter, _| *counter > current);

        info!(
            "Run {} step {}: {} contribution(s) at counter {}",
            self.ctx.run_id,
            self.index,
            round.len(),
            current
        );

        Ok(expected
            .iter()
            .filter_map(|user| round.get(user))
            .filter(|result| result.error.is_none())
            .map(|result| UserResult {
                username: result.username.clone(),
                data: result.data.clone(),
            })
            .collect())
    }

    /// Tells every participant the step failed, best effort
    async fn notify_failure(&self, state: &StepState, error: &PipelineError) {
        let notice = RemoteResult::failure(
            self.ctx.run_id.clone(),
            self.index,
            state.iteration + 1,
            self.ctx.clients.clone(),
            error.to_string(),
        );
        if let Err(e) = self.publish(TransportMessage::Remote(notice)).await {
            warn!("Failed to notify participants of run {}: {}", self.ctx.run_id, e);
        }
    }
}
