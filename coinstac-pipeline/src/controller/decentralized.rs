//! Controller for steps split between participants and an aggregator

use coinstac_core::domain::pipeline::{ControllerOptions, PluginKind};
use coinstac_core::domain::run::RunMode;
use coinstac_core::dto::transport::{LocalResult, RemoteResult};
use tracing::warn;

use super::group::{Contribution, GroupSync};
use super::{Controller, Decision, limit_reached};
use crate::driver::ComputationOutput;
use crate::pipeline::state::StepState;

#[derive(Debug, Clone)]
pub struct DecentralizedController {
    mode: RunMode,
    max_iterations: Option<u32>,
    halt_at_group_step: Option<u32>,
    tolerate_timeout: bool,
    tolerate_user_errors: bool,
    group_step: bool,
}

impl DecentralizedController {
    pub fn new(mode: RunMode, options: &ControllerOptions) -> Self {
        Self {
            mode,
            max_iterations: options.max_iterations,
            halt_at_group_step: options.halt_at_group_step,
            tolerate_timeout: options.tolerate_timeout,
            tolerate_user_errors: options.tolerate_user_errors,
            group_step: options.plugins.contains(&PluginKind::GroupStep),
        }
    }

    /// Aggregate whoever contributed when the peer wait runs out
    pub fn tolerates_timeout(&self) -> bool {
        self.tolerate_timeout
    }

    pub fn tolerates_user_errors(&self) -> bool {
        self.tolerate_user_errors
    }

    /// Counter a contribution is filed under
    ///
    /// With the group-step plugin participants report their own step,
    /// otherwise the iteration is the counter.
    pub fn counter(&self, result: &LocalResult) -> u32 {
        if self.group_step {
            result
                .plugin_state
                .group_step
                .as_ref()
                .map(|g| g.step)
                .unwrap_or(result.iteration)
        } else {
            result.iteration
        }
    }

    /// Files one participant contribution on the aggregator
    pub fn on_contribution(
        &self,
        sync: &mut GroupSync,
        result: &LocalResult,
        expected: &[String],
    ) -> Decision {
        if let Some(error) = result.error.as_ref().filter(|_| !self.tolerate_user_errors) {
            return Decision::Cancel(format!(
                "Participant '{}' failed: {}",
                result.username, error
            ));
        }

        let counter = self.counter(result);
        match sync.record(&result.username, counter) {
            Contribution::Counted => {}
            Contribution::Stale => {
                warn!(
                    "Dropping stale contribution from {} at counter {} (group is at {})",
                    result.username,
                    counter,
                    sync.step()
                );
            }
            Contribution::Duplicate => {
                warn!(
                    "Dropping duplicate contribution from {} at counter {}",
                    result.username, counter
                );
            }
        }

        if sync.is_ready(expected) {
            Decision::Advance
        } else {
            Decision::WaitForPeers
        }
    }

    fn halted(&self, state: &StepState) -> bool {
        self.halt_at_group_step
            .is_some_and(|halt| state.sync.step() >= halt)
    }
}

impl Controller for DecentralizedController {
    fn pre_iteration(&self, state: &StepState) -> Decision {
        if limit_reached(self.max_iterations, state) {
            Decision::Done
        } else {
            Decision::Repeat
        }
    }

    fn decide(
        &self,
        state: &StepState,
        latest: &ComputationOutput,
        remote: Option<&RemoteResult>,
    ) -> Decision {
        match (self.mode, remote) {
            (RunMode::Local, Some(remote)) => {
                if let Some(error) = &remote.error {
                    Decision::Cancel(format!("Aggregator reported failure: {}", error))
                } else if remote.complete {
                    Decision::Done
                } else {
                    Decision::Repeat
                }
            }
            (RunMode::Local, None) => Decision::WaitForPeers,
            (RunMode::Remote, _) => {
                if latest.success || limit_reached(self.max_iterations, state) || self.halted(state) {
                    Decision::Done
                } else {
                    Decision::Repeat
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinstac_core::dto::transport::{GroupStepState, PluginState};
    use serde_json::json;

    fn contribution(username: &str, iteration: u32, step: Option<u32>) -> LocalResult {
        LocalResult {
            username: username.to_string(),
            run_id: "run-1".to_string(),
            step: 0,
            iteration,
            data: json!({}),
            plugin_state: PluginState {
                group_step: step.map(GroupStepState::reporting),
            },
            error: None,
            files: vec![],
        }
    }

    fn remote(complete: bool, error: Option<&str>) -> RemoteResult {
        RemoteResult {
            run_id: "run-1".to_string(),
            step: 0,
            iteration: 1,
            usernames: vec!["alice".to_string()],
            user_results: vec![],
            data: json!({}),
            plugin_state: PluginState::default(),
            complete,
            error: error.map(str::to_string),
            files: vec![],
        }
    }

    #[test]
    fn test_participant_follows_aggregator() {
        let controller = DecentralizedController::new(RunMode::Local, &ControllerOptions::default());
        let state = StepState::new(0, json!({}));
        let output = ComputationOutput::unfinished(json!({}));

        assert_eq!(controller.decide(&state, &output, None), Decision::WaitForPeers);
        assert_eq!(
            controller.decide(&state, &output, Some(&remote(false, None))),
            Decision::Repeat
        );
        assert_eq!(
            controller.decide(&state, &output, Some(&remote(true, None))),
            Decision::Done
        );
        assert!(matches!(
            controller.decide(&state, &output, Some(&remote(false, Some("boom")))),
            Decision::Cancel(_)
        ));
    }

    #[test]
    fn test_aggregator_waits_then_advances() {
        let controller = DecentralizedController::new(RunMode::Remote, &ControllerOptions::default());
        let expected = vec!["alice".to_string(), "bob".to_string()];
        let mut sync = GroupSync::new();

        assert_eq!(
            controller.on_contribution(&mut sync, &contribution("alice", 1, None), &expected),
            Decision::WaitForPeers
        );
        assert_eq!(
            controller.on_contribution(&mut sync, &contribution("bob", 1, None), &expected),
            Decision::Advance
        );
    }

    #[test]
    fn test_participant_error_cancels_unless_tolerated() {
        let mut failed = contribution("alice", 1, None);
        failed.error = Some("exit 1".to_string());
        let expected = vec!["alice".to_string()];

        let strict = DecentralizedController::new(RunMode::Remote, &ControllerOptions::default());
        assert!(matches!(
            strict.on_contribution(&mut GroupSync::new(), &failed, &expected),
            Decision::Cancel(_)
        ));

        let tolerant = DecentralizedController::new(
            RunMode::Remote,
            &ControllerOptions {
                tolerate_user_errors: true,
                ..Default::default()
            },
        );
        assert_eq!(
            tolerant.on_contribution(&mut GroupSync::new(), &failed, &expected),
            Decision::Advance
        );
    }

    #[test]
    fn test_group_step_counter_comes_from_plugin_state() {
        let options = ControllerOptions {
            plugins: vec![PluginKind::GroupStep],
            halt_at_group_step: Some(3),
            ..Default::default()
        };
        let controller = DecentralizedController::new(RunMode::Remote, &options);
        assert_eq!(controller.counter(&contribution("alice", 7, Some(2))), 2);

        let mut state = StepState::new(0, json!({}));
        let output = ComputationOutput::unfinished(json!({}));
        state.sync.bump();
        assert_eq!(controller.decide(&state, &output, None), Decision::Repeat);
        state.sync.bump();
        assert_eq!(controller.decide(&state, &output, None), Decision::Done);
    }
}
