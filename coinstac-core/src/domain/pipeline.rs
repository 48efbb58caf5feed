//! Pipeline domain types

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::computation::ComputationDefinition;

/// Pipeline definition
///
/// Immutable shape of a run: an ordered list of steps. Shared between the
/// remote aggregator and every local participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub steps: Vec<Step>,
}

impl PipelineSpec {
    /// Every image the given mode will start, without duplicates
    ///
    /// The aggregator only runs decentralized steps.
    pub fn images_for(&self, mode: super::run::RunMode) -> Vec<String> {
        let mut images: Vec<String> = Vec::new();
        for step in &self.steps {
            if mode == super::run::RunMode::Remote
                && step.controller.resolved_type() != Some(ControllerType::Decentralized)
            {
                continue;
            }
            for computation in &step.computations {
                for image in computation.images_for(mode) {
                    if !images.contains(&image) {
                        images.push(image);
                    }
                }
            }
        }
        images
    }

    pub fn is_decentralized(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.controller.resolved_type() == Some(ControllerType::Decentralized))
    }
}

/// One stage of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub id: String,
    pub controller: ControllerSpec,
    pub computations: Vec<ComputationDefinition>,
    #[serde(default, alias = "ioMap")]
    pub input_map: BTreeMap<String, InputMapping>,
}

impl Step {
    /// The computation this step runs
    ///
    /// Steps carry exactly one computation once validated.
    pub fn computation(&self) -> Option<&ComputationDefinition> {
        self.computations.first()
    }
}

/// Which controller drives a step and how
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub controller_type: Option<ControllerType>,
    #[serde(default)]
    pub options: ControllerOptions,
}

impl ControllerSpec {
    pub fn local() -> Self {
        Self {
            controller_type: Some(ControllerType::Local),
            ..Default::default()
        }
    }

    pub fn decentralized() -> Self {
        Self {
            controller_type: Some(ControllerType::Decentralized),
            ..Default::default()
        }
    }

    /// The controller type, read from `type` or from `options.type`
    pub fn resolved_type(&self) -> Option<ControllerType> {
        self.controller_type.or(self.options.controller_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    Local,
    Decentralized,
}

impl std::fmt::Display for ControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerType::Local => write!(f, "local"),
            ControllerType::Decentralized => write!(f, "decentralized"),
        }
    }
}

/// Per-step controller options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerOptions {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub controller_type: Option<ControllerType>,
    /// How long to wait for peers, overrides the run timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Continue with the participants present when the peer wait times out
    #[serde(default)]
    pub tolerate_timeout: bool,
    /// A participant error is handled locally instead of failing the run
    #[serde(default)]
    pub tolerate_user_errors: bool,
    /// Fixed iteration count after which the step is done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Group step value at which a group-step run is done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_at_group_step: Option<u32>,
    #[serde(default)]
    pub plugins: Vec<PluginKind>,
}

/// Cross-cutting step behaviours selected by name in a pipeline file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    #[serde(rename = "group-step")]
    GroupStep,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginKind::GroupStep => write!(f, "group-step"),
        }
    }
}

/// How a computation input is fulfilled
///
/// Untagged: the shape of the object picks the variant, so the order of
/// the variants matters (`value` is the catch-all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputMapping {
    FromCache {
        #[serde(rename = "fromCache")]
        from_cache: CacheRef,
    },
    Files {
        files: FileSelector,
    },
    Value {
        value: JsonValue,
    },
}

impl InputMapping {
    pub fn value(value: JsonValue) -> Self {
        InputMapping::Value { value }
    }

    pub fn from_cache(step: usize, variable: impl Into<String>) -> Self {
        InputMapping::FromCache {
            from_cache: CacheRef {
                step,
                variable: variable.into(),
            },
        }
    }
}

/// Reference to a variable produced by an earlier step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRef {
    pub step: usize,
    pub variable: String,
}

/// Selects files from a listing supplied with the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSelector {
    pub source: String,
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl FileSelector {
    pub fn matches(&self, file: &str) -> bool {
        self.extensions.is_empty()
            || self
                .extensions
                .iter()
                .any(|ext| file.ends_with(&format!(".{}", ext.trim_start_matches('.'))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn computation() -> JsonValue {
        json!({
            "meta": { "id": "sum", "name": "sum", "description": "sum", "repository": "r", "version": "1" },
            "computation": { "type": "docker", "dockerImage": "sum", "command": ["run"] }
        })
    }

    #[test]
    fn test_parse_input_mappings() {
        let map: BTreeMap<String, InputMapping> = serde_json::from_value(json!({
            "start": { "value": 1 },
            "prev": { "fromCache": { "step": 0, "variable": "sum" } },
            "data": { "files": { "source": "site", "extensions": ["csv"] } }
        }))
        .unwrap();

        assert_eq!(map["start"], InputMapping::value(json!(1)));
        assert_eq!(map["prev"], InputMapping::from_cache(0, "sum"));
        assert!(matches!(map["data"], InputMapping::Files { .. }));
    }

    #[test]
    fn test_value_may_itself_be_an_object() {
        let mapping: InputMapping =
            serde_json::from_value(json!({ "value": { "fromCache": 3 } })).unwrap();
        assert_eq!(mapping, InputMapping::value(json!({ "fromCache": 3 })));
    }

    #[test]
    fn test_controller_type_from_options() {
        let step: Step = serde_json::from_value(json!({
            "id": "s0",
            "controller": { "id": "ctrl", "options": { "type": "decentralized", "plugins": ["group-step"] } },
            "computations": [computation()],
            "ioMap": { "start": { "value": 0 } }
        }))
        .unwrap();

        assert_eq!(
            step.controller.resolved_type(),
            Some(ControllerType::Decentralized)
        );
        assert_eq!(step.controller.options.plugins, vec![PluginKind::GroupStep]);
        assert_eq!(step.input_map.len(), 1);
    }

    #[test]
    fn test_images_deduplicated() {
        let spec: PipelineSpec = serde_json::from_value(json!({
            "steps": [
                { "controller": { "type": "local" }, "computations": [computation()] },
                { "controller": { "type": "local" }, "computations": [computation()] }
            ]
        }))
        .unwrap();

        assert_eq!(spec.images_for(super::super::run::RunMode::Local), vec!["sum"]);
        assert!(!spec.is_decentralized());
    }

    #[test]
    fn test_file_selector_extensions() {
        let selector = FileSelector {
            source: "site".to_string(),
            extensions: vec![".csv".to_string()],
        };
        assert!(selector.matches("a.csv"));
        assert!(!selector.matches("a.json"));
    }
}
