use coinstac_core::domain::pipeline::PluginKind;
use coinstac_core::dto::transport::{GroupStepState, PluginState, RemoteResult};

use super::{StepHooks, StepPlugin};
use crate::controller::GroupSync;

/// Lock-step iteration across participants
///
/// Each participant reports a step counter one above the last one it
/// reported. It skips its computation while it is already at the group's
/// step, i.e. it contributed and the group has not moved yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupStepPlugin;

impl StepPlugin for GroupStepPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::GroupStep
    }

    fn pre_run_local(
        &self,
        remote: Option<&RemoteResult>,
        state: &mut PluginState,
        hooks: &mut StepHooks,
    ) {
        let user_step = state.group_step.as_ref().map(|g| g.step).unwrap_or(0);
        let group_step = remote
            .and_then(|r| r.plugin_state.group_step.as_ref())
            .map(|g| g.step)
            .unwrap_or(1);

        if user_step == group_step {
            hooks.cancel_run();
        } else {
            hooks.force_save();
            state.group_step = Some(GroupStepState::reporting(user_step + 1));
        }
    }

    fn pre_run_remote(&self, sync: &GroupSync, state: &mut PluginState, hooks: &mut StepHooks) {
        hooks.force_save();
        state.group_step = Some(sync.state().clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote_at(step: u32) -> RemoteResult {
        RemoteResult {
            run_id: "run-1".to_string(),
            step: 0,
            iteration: 1,
            usernames: vec![],
            user_results: vec![],
            data: json!({}),
            plugin_state: PluginState {
                group_step: Some(GroupStepState::reporting(step)),
            },
            complete: false,
            error: None,
            files: vec![],
        }
    }

    #[test]
    fn test_first_report_is_step_one() {
        let mut state = PluginState::default();
        let mut hooks = StepHooks::default();
        GroupStepPlugin.pre_run_local(None, &mut state, &mut hooks);

        assert_eq!(state.group_step.unwrap().step, 1);
        assert!(hooks.save_requested());
        assert!(!hooks.run_cancelled());
    }

    #[test]
    fn test_participant_waits_until_group_moves() {
        let mut state = PluginState {
            group_step: Some(GroupStepState::reporting(1)),
        };

        let mut hooks = StepHooks::default();
        GroupStepPlugin.pre_run_local(Some(&remote_at(1)), &mut state, &mut hooks);
        assert!(hooks.run_cancelled());
        assert_eq!(state.group_step.as_ref().unwrap().step, 1);

        let mut hooks = StepHooks::default();
        GroupStepPlugin.pre_run_local(Some(&remote_at(2)), &mut state, &mut hooks);
        assert!(!hooks.run_cancelled());
        assert_eq!(state.group_step.unwrap().step, 2);
    }

    #[test]
    fn test_remote_publishes_group_counters() {
        let mut sync = GroupSync::new();
        sync.record("alice", 1);
        sync.bump();

        let mut state = PluginState::default();
        let mut hooks = StepHooks::default();
        GroupStepPlugin.pre_run_remote(&sync, &mut state, &mut hooks);

        let group = state.group_step.unwrap();
        assert_eq!(group.step, 2);
        assert_eq!(group.user_step["alice"], 1);
    }
}
