//! Wire messages exchanged between participants and the aggregator
//!
//! Each decentralized iteration a local participant sends a `LocalResult`
//! and the aggregator answers every participant with a `RemoteResult`.
//! Both carry whatever the sending computation left in its transfer
//! directory.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Plugin state carried alongside computation output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginState {
    #[serde(
        rename = "group-step",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub group_step: Option<GroupStepState>,
}

/// Group-step counters
///
/// On a participant only `step` is meaningful (the step the participant
/// reports). On the aggregator `step` is the shared group step and
/// `user_step` the last step each participant reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStepState {
    pub step: u32,
    #[serde(default)]
    pub user_step: BTreeMap<String, u32>,
}

impl Default for GroupStepState {
    /// The group starts at step 1 with nobody reported
    fn default() -> Self {
        Self {
            step: 1,
            user_step: BTreeMap::new(),
        }
    }
}

impl GroupStepState {
    /// Participant-side state reporting `step`
    pub fn reporting(step: u32) -> Self {
        Self {
            step,
            user_step: BTreeMap::new(),
        }
    }
}

/// A file a computation left for its peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferredFile {
    /// Relative to the sender's transfer directory, `/`-separated
    pub path: String,
    pub contents: Vec<u8>,
}

/// Participant -> aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalResult {
    pub username: String,
    pub run_id: String,
    /// Index of the pipeline step the result belongs to
    #[serde(default)]
    pub step: usize,
    pub iteration: u32,
    pub data: JsonValue,
    #[serde(default)]
    pub plugin_state: PluginState,
    /// Set when the participant's computation failed this iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<TransferredFile>,
}

/// One participant's contribution as seen by the aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResult {
    pub username: String,
    pub data: JsonValue,
}

/// Aggregator -> participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResult {
    pub run_id: String,
    #[serde(default)]
    pub step: usize,
    pub iteration: u32,
    pub usernames: Vec<String>,
    pub user_results: Vec<UserResult>,
    /// Output of the aggregator's computation
    pub data: JsonValue,
    #[serde(default)]
    pub plugin_state: PluginState,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<TransferredFile>,
}

impl RemoteResult {
    /// A message telling every participant the run failed
    pub fn failure(
        run_id: impl Into<String>,
        step: usize,
        iteration: u32,
        usernames: Vec<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step,
            iteration,
            usernames,
            user_results: vec![],
            data: JsonValue::Null,
            plugin_state: PluginState::default(),
            complete: false,
            error: Some(error.into()),
            files: vec![],
        }
    }
}

/// Envelope for everything that goes over a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportMessage {
    Local(LocalResult),
    Remote(RemoteResult),
}

impl TransportMessage {
    pub fn run_id(&self) -> &str {
        match self {
            TransportMessage::Local(l) => &l.run_id,
            TransportMessage::Remote(r) => &r.run_id,
        }
    }

    pub fn step(&self) -> usize {
        match self {
            TransportMessage::Local(l) => l.step,
            TransportMessage::Remote(r) => r.step,
        }
    }

    pub fn iteration(&self) -> u32 {
        match self {
            TransportMessage::Local(l) => l.iteration,
            TransportMessage::Remote(r) => r.iteration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_result_wire_format() {
        let msg = TransportMessage::Local(LocalResult {
            username: "alice".to_string(),
            run_id: "run-1".to_string(),
            step: 0,
            iteration: 2,
            data: json!({ "sum": 3 }),
            plugin_state: PluginState {
                group_step: Some(GroupStepState::reporting(2)),
            },
            error: None,
            files: vec![],
        });

        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["kind"], "local");
        assert_eq!(wire["runId"], "run-1");
        assert_eq!(wire["pluginState"]["group-step"]["step"], 2);
        assert!(wire.get("error").is_none());
        assert!(wire.get("files").is_none());
    }

    #[test]
    fn test_remote_result_parses_without_plugin_state() {
        let msg: TransportMessage = serde_json::from_value(json!({
            "kind": "remote",
            "runId": "run-1",
            "step": 1,
            "iteration": 1,
            "usernames": ["alice", "bob"],
            "userResults": [{ "username": "alice", "data": 1 }],
            "data": { "mean": 1.5 },
            "complete": true
        }))
        .unwrap();

        match msg {
            TransportMessage::Remote(remote) => {
                assert!(remote.complete);
                assert_eq!(remote.step, 1);
                assert_eq!(remote.plugin_state, PluginState::default());
                assert_eq!(remote.user_results.len(), 1);
                assert!(remote.files.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_files_travel_with_the_result() {
        let msg: TransportMessage = serde_json::from_value(json!({
            "kind": "local",
            "username": "alice",
            "runId": "run-1",
            "iteration": 1,
            "data": {},
            "files": [{ "path": "model/beta.csv", "contents": [49, 44, 50] }]
        }))
        .unwrap();

        match msg {
            TransportMessage::Local(local) => {
                assert_eq!(local.files.len(), 1);
                assert_eq!(local.files[0].path, "model/beta.csv");
                assert_eq!(local.files[0].contents, b"1,2");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_group_step_default_starts_at_one() {
        let state = GroupStepState::default();
        assert_eq!(state.step, 1);
        assert!(state.user_step.is_empty());
    }
}
