//! Mutable record of the step being executed

use coinstac_core::domain::run::RunMode;
use coinstac_core::dto::state::StepCheckpoint;
use coinstac_core::dto::transport::{PluginState, RemoteResult};
use serde_json::{Value as JsonValue, json};

use crate::controller::GroupSync;
use crate::driver::ComputationOutput;

#[derive(Debug, Clone)]
pub struct StepState {
    pub index: usize,
    /// Completed computation runs, starts at 0
    pub iteration: u32,
    /// Input of the next computation run
    pub next_input: JsonValue,
    pub current_output: Option<ComputationOutput>,
    /// The computation's private cache
    pub computation_cache: JsonValue,
    pub plugin_state: PluginState,
    /// Shared counters, aggregator only
    pub sync: GroupSync,
    /// Last aggregator answer, participant only
    pub last_remote: Option<RemoteResult>,
}

impl StepState {
    pub fn new(index: usize, input: JsonValue) -> Self {
        Self {
            index,
            iteration: 0,
            next_input: input,
            current_output: None,
            computation_cache: json!({}),
            plugin_state: PluginState::default(),
            sync: GroupSync::new(),
            last_remote: None,
        }
    }

    /// Rebuilds the state saved by a suspended run
    ///
    /// On the aggregator the group counters travel in the checkpoint's
    /// plugin state; they only stay visible to the computation when the
    /// step enables the group-step plugin.
    pub fn resume(checkpoint: &StepCheckpoint, mode: RunMode, group_step_plugin: bool) -> Self {
        let mut plugin_state = checkpoint.plugin_state.clone();
        let sync = match mode {
            RunMode::Remote => {
                let counters = if group_step_plugin {
                    plugin_state.group_step.clone()
                } else {
                    plugin_state.group_step.take()
                };
                counters.map(GroupSync::from_state).unwrap_or_default()
            }
            RunMode::Local => GroupSync::new(),
        };

        Self {
            index: checkpoint.step,
            iteration: checkpoint.iteration,
            next_input: checkpoint.next_input.clone(),
            current_output: None,
            computation_cache: checkpoint.computation_cache.clone(),
            plugin_state,
            sync,
            last_remote: checkpoint.last_remote.clone(),
        }
    }

    pub fn checkpoint(&self, mode: RunMode) -> StepCheckpoint {
        let mut plugin_state = self.plugin_state.clone();
        if mode == RunMode::Remote {
            plugin_state.group_step = Some(self.sync.state().clone());
        }

        StepCheckpoint {
            step: self.index,
            iteration: self.iteration,
            next_input: self.next_input.clone(),
            computation_cache: self.computation_cache.clone(),
            plugin_state,
            last_remote: self.last_remote.clone(),
        }
    }

    /// Takes in a computation's output: its data feeds the next iteration
    /// and its cache is merged into the private cache
    pub fn absorb(&mut self, output: ComputationOutput) {
        if let Some(cache) = &output.cache {
            merge_cache(&mut self.computation_cache, cache);
        }
        self.next_input = output.data.clone();
        self.current_output = Some(output);
    }

    pub fn latest_data(&self) -> Option<&JsonValue> {
        self.current_output.as_ref().map(|o| &o.data)
    }
}

fn merge_cache(target: &mut JsonValue, update: &JsonValue) {
    match (target, update) {
        (JsonValue::Object(target), JsonValue::Object(update)) => {
            for (key, value) in update {
                target.insert(key.clone(), value.clone());
            }
        }
        (target, update) => *target = update.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_feeds_next_iteration() {
        let mut state = StepState::new(0, json!({ "start": 1 }));
        state.absorb(
            ComputationOutput::unfinished(json!({ "sum": 3 })).with_cache(json!({ "seen": 1 })),
        );
        state.absorb(
            ComputationOutput::unfinished(json!({ "sum": 5 })).with_cache(json!({ "last": 5 })),
        );

        assert_eq!(state.next_input, json!({ "sum": 5 }));
        assert_eq!(state.computation_cache, json!({ "seen": 1, "last": 5 }));
        assert_eq!(state.latest_data(), Some(&json!({ "sum": 5 })));
    }

    #[test]
    fn test_aggregator_checkpoint_keeps_counters() {
        let mut state = StepState::new(2, json!({}));
        state.iteration = 3;
        state.sync.record("alice", 1);
        state.sync.bump();

        let checkpoint = state.checkpoint(RunMode::Remote);
        assert_eq!(checkpoint.plugin_state.group_step.as_ref().unwrap().step, 2);

        let resumed = StepState::resume(&checkpoint, RunMode::Remote, false);
        assert_eq!(resumed.sync.step(), 2);
        assert_eq!(resumed.iteration, 3);
        assert!(resumed.plugin_state.group_step.is_none());

        let with_plugin = StepState::resume(&checkpoint, RunMode::Remote, true);
        assert!(with_plugin.plugin_state.group_step.is_some());
    }

    #[test]
    fn test_participant_checkpoint_has_no_counters() {
        let state = StepState::new(0, json!({}));
        let checkpoint = state.checkpoint(RunMode::Local);
        assert!(checkpoint.plugin_state.group_step.is_none());
    }
}
