//! Step plugins
//!
//! Plugins are named in a step's controller options and resolved once, when
//! the step starts, into a fixed set of hook implementations.

mod group_step;

pub use group_step::GroupStepPlugin;

use coinstac_core::domain::pipeline::PluginKind;
use coinstac_core::dto::transport::{PluginState, RemoteResult};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::controller::GroupSync;

/// Requests a plugin makes of the step loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepHooks {
    cancel_run: bool,
    force_save: bool,
}

impl StepHooks {
    /// Skip the computation this iteration
    pub fn cancel_run(&mut self) {
        self.cancel_run = true;
    }

    /// Checkpoint the step state before going on
    pub fn force_save(&mut self) {
        self.force_save = true;
    }

    pub fn run_cancelled(&self) -> bool {
        self.cancel_run
    }

    pub fn save_requested(&self) -> bool {
        self.force_save
    }

    fn merge(&mut self, other: StepHooks) {
        self.cancel_run |= other.cancel_run;
        self.force_save |= other.force_save;
    }
}

pub trait StepPlugin: Send + Sync {
    fn kind(&self) -> PluginKind;

    /// Before a participant runs its computation, with the aggregator's last
    /// answer if there is one
    fn pre_run_local(
        &self,
        _remote: Option<&RemoteResult>,
        _state: &mut PluginState,
        _hooks: &mut StepHooks,
    ) {
    }

    /// Before the aggregator runs its computation
    fn pre_run_remote(&self, _sync: &GroupSync, _state: &mut PluginState, _hooks: &mut StepHooks) {}

    /// After a computation ran, may rewrite its output
    fn post_run(&self, output: JsonValue, _state: &PluginState) -> JsonValue {
        output
    }
}

fn plugin_for(kind: PluginKind) -> Arc<dyn StepPlugin> {
    match kind {
        PluginKind::GroupStep => Arc::new(GroupStepPlugin),
    }
}

/// The plugins enabled on one step
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn StepPlugin>>,
}

impl PluginSet {
    pub fn from_kinds(kinds: &[PluginKind]) -> Self {
        let mut plugins: Vec<Arc<dyn StepPlugin>> = Vec::new();
        for kind in kinds {
            if !plugins.iter().any(|p| p.kind() == *kind) {
                plugins.push(plugin_for(*kind));
            }
        }
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn pre_run_local(&self, remote: Option<&RemoteResult>, state: &mut PluginState) -> StepHooks {
        let mut hooks = StepHooks::default();
        for plugin in &self.plugins {
            let mut own = StepHooks::default();
            plugin.pre_run_local(remote, state, &mut own);
            hooks.merge(own);
        }
        hooks
    }

    pub fn pre_run_remote(&self, sync: &GroupSync, state: &mut PluginState) -> StepHooks {
        let mut hooks = StepHooks::default();
        for plugin in &self.plugins {
            let mut own = StepHooks::default();
            plugin.pre_run_remote(sync, state, &mut own);
            hooks.merge(own);
        }
        hooks
    }

    pub fn post_run(&self, output: JsonValue, state: &PluginState) -> JsonValue {
        self.plugins
            .iter()
            .fold(output, |output, plugin| plugin.post_run(output, state))
    }
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.kind()))
            .finish()
    }
}
