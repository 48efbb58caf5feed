//! Computation domain types
//!
//! A computation is the unit of user code a pipeline step runs. The
//! orchestrator never looks inside it: it only knows how to start it
//! (`ComputationKind`) and what it consumes and produces (variable schemas).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// A computation definition as published in the computation registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationDefinition {
    pub meta: ComputationMeta,
    pub computation: ComputationSpec,
}

impl ComputationDefinition {
    /// Returns the computation part that runs for the given mode
    ///
    /// Local participants always run the main computation. The remote
    /// aggregator runs the `remote` part when there is one.
    pub fn kind_for(&self, mode: super::run::RunMode) -> &ComputationKind {
        match (mode, &self.computation.remote) {
            (super::run::RunMode::Remote, Some(remote)) => &remote.kind,
            _ => &self.computation.kind,
        }
    }

    /// All container images this computation needs in the given mode
    pub fn images_for(&self, mode: super::run::RunMode) -> Vec<String> {
        match self.kind_for(mode) {
            ComputationKind::Docker { docker_image, .. } => vec![docker_image.clone()],
            ComputationKind::Cmd { .. } => vec![],
        }
    }
}

/// Registry metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationMeta {
    pub id: String,
    pub name: String,
    pub description: String,
    pub repository: String,
    pub version: String,
}

/// What to run and its input/output contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationSpec {
    #[serde(flatten)]
    pub kind: ComputationKind,
    #[serde(default)]
    pub input: BTreeMap<String, VariableSpec>,
    #[serde(default)]
    pub output: BTreeMap<String, VariableSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteComputationSpec>,
}

/// The aggregator half of a decentralized computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteComputationSpec {
    #[serde(flatten)]
    pub kind: ComputationKind,
}

/// How a computation is started
///
/// Tagged on `type`, so a registry entry reads
/// `{"type": "docker", "dockerImage": "...", "command": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ComputationKind {
    /// Run inside a container image
    Docker {
        #[serde(rename = "dockerImage")]
        docker_image: String,
        command: Vec<String>,
    },
    /// Run a host process directly
    Cmd { command: Vec<String> },
}

impl ComputationKind {
    pub fn command(&self) -> &[String] {
        match self {
            ComputationKind::Docker { command, .. } | ComputationKind::Cmd { command } => command,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ComputationKind::Docker { .. } => "docker",
            ComputationKind::Cmd { .. } => "cmd",
        }
    }
}

/// Declared input or output variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(rename = "type", default)]
    pub variable_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    #[serde(default)]
    pub optional: bool,
}

impl VariableSpec {
    pub fn of(variable_type: VariableType) -> Self {
        Self {
            variable_type,
            label: None,
            default: None,
            optional: false,
        }
    }

    pub fn with_default(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Number,
    String,
    Boolean,
    Array,
    Object,
    Files,
    #[default]
    Any,
}

impl VariableType {
    /// Checks a JSON value against this type
    pub fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            VariableType::Number => value.is_number(),
            VariableType::String => value.is_string(),
            VariableType::Boolean => value.is_boolean(),
            VariableType::Array | VariableType::Files => value.is_array(),
            VariableType::Object => value.is_object(),
            VariableType::Any => true,
        }
    }
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VariableType::Number => "number",
            VariableType::String => "string",
            VariableType::Boolean => "boolean",
            VariableType::Array => "array",
            VariableType::Object => "object",
            VariableType::Files => "files",
            VariableType::Any => "any",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::RunMode;
    use serde_json::json;

    #[test]
    fn test_parse_docker_computation() {
        let def: ComputationDefinition = serde_json::from_value(json!({
            "meta": {
                "id": "add2",
                "name": "Add two",
                "description": "adds two to start",
                "repository": "https://example.org/add2",
                "version": "1.0.0"
            },
            "computation": {
                "type": "docker",
                "dockerImage": "coinstacteam/add2",
                "command": ["python", "/computation/local.py"],
                "input": { "start": { "type": "number" } },
                "output": { "sum": { "type": "number" } },
                "remote": {
                    "type": "docker",
                    "dockerImage": "coinstacteam/add2-remote",
                    "command": ["python", "/computation/remote.py"]
                }
            }
        }))
        .unwrap();

        assert_eq!(def.meta.id, "add2");
        assert_eq!(def.computation.kind.command().len(), 2);
        assert_eq!(def.images_for(RunMode::Local), vec!["coinstacteam/add2"]);
        assert_eq!(def.images_for(RunMode::Remote), vec!["coinstacteam/add2-remote"]);
        assert_eq!(
            def.computation.input["start"].variable_type,
            VariableType::Number
        );
    }

    #[test]
    fn test_remote_falls_back_to_main_kind() {
        let def: ComputationDefinition = serde_json::from_value(json!({
            "meta": { "id": "a", "name": "a", "description": "a", "repository": "a", "version": "1" },
            "computation": { "type": "cmd", "command": ["echo"] }
        }))
        .unwrap();

        assert_eq!(def.kind_for(RunMode::Remote).label(), "cmd");
        assert!(def.images_for(RunMode::Remote).is_empty());
    }

    #[test]
    fn test_variable_type_accepts() {
        assert!(VariableType::Number.accepts(&json!(3)));
        assert!(!VariableType::Number.accepts(&json!("3")));
        assert!(VariableType::Files.accepts(&json!(["a.csv"])));
        assert!(VariableType::Any.accepts(&json!(null)));
    }
}
