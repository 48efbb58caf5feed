//! Checks run before a pipeline is accepted
//!
//! Everything here fails with [`PipelineError::Validation`] and happens at
//! `start_pipeline` time, so a malformed spec never reaches a running
//! pipeline.

use coinstac_core::domain::computation::{ComputationDefinition, ComputationKind};
use coinstac_core::domain::pipeline::{ControllerType, InputMapping, PipelineSpec, Step};
use coinstac_core::domain::run::RunMode;
use std::collections::BTreeSet;

use crate::error::{PipelineError, Result};
use crate::manager::StartRequest;

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Validation(message.into())
}

/// Validates a pipeline specification on its own
pub fn validate_spec(spec: &PipelineSpec) -> Result<()> {
    if spec.steps.is_empty() {
        return Err(invalid("Pipeline must have at least one step"));
    }

    let mut ids = BTreeSet::new();
    for (index, step) in spec.steps.iter().enumerate() {
        if !step.id.is_empty() && !ids.insert(step.id.as_str()) {
            return Err(invalid(format!("Duplicate step id '{}'", step.id)));
        }
        validate_step(spec, index, step)?;
    }

    Ok(())
}

fn validate_step(spec: &PipelineSpec, index: usize, step: &Step) -> Result<()> {
    let computation = match step.computations.as_slice() {
        [computation] => computation,
        [] => return Err(invalid(format!("Step {} has no computation", index))),
        more => {
            return Err(invalid(format!(
                "Step {} has {} computations, exactly one is allowed",
                index,
                more.len()
            )));
        }
    };
    validate_computation(index, computation)?;

    match step.controller.resolved_type() {
        None => {
            return Err(invalid(format!("Step {} does not name a controller type", index)));
        }
        Some(ControllerType::Decentralized) if computation.computation.remote.is_none() => {
            return Err(invalid(format!(
                "Step {} is decentralized but computation '{}' has no remote part",
                index, computation.meta.id
            )));
        }
        Some(_) => {}
    }

    if step.controller.options.timeout_ms == Some(0) {
        return Err(invalid(format!("Step {} declares a zero timeout", index)));
    }

    validate_input_map(spec, index, step, computation)
}

fn validate_computation(index: usize, definition: &ComputationDefinition) -> Result<()> {
    let meta = &definition.meta;
    for (field, value) in [
        ("id", &meta.id),
        ("name", &meta.name),
        ("description", &meta.description),
        ("repository", &meta.repository),
        ("version", &meta.version),
    ] {
        if value.trim().is_empty() {
            return Err(invalid(format!(
                "Step {} computation meta.{} cannot be empty",
                index, field
            )));
        }
    }

    validate_kind(index, &definition.computation.kind)?;
    if let Some(remote) = &definition.computation.remote {
        validate_kind(index, &remote.kind)?;
    }
    Ok(())
}

fn validate_kind(index: usize, kind: &ComputationKind) -> Result<()> {
    if kind.command().is_empty() {
        return Err(invalid(format!(
            "Step {} {} computation has an empty command",
            index,
            kind.label()
        )));
    }
    if let ComputationKind::Docker { docker_image, .. } = kind {
        if docker_image.trim().is_empty() {
            return Err(invalid(format!("Step {} computation has no dockerImage", index)));
        }
    }
    Ok(())
}

fn validate_input_map(
    spec: &PipelineSpec,
    index: usize,
    step: &Step,
    computation: &ComputationDefinition,
) -> Result<()> {
    let declared = &computation.computation.input;

    for (name, mapping) in &step.input_map {
        let variable = declared.get(name);
        if variable.is_none() && !declared.is_empty() {
            return Err(invalid(format!(
                "Step {} maps input '{}' which computation '{}' does not declare",
                index, name, computation.meta.id
            )));
        }

        match mapping {
            InputMapping::Value { value } => {
                if let Some(variable) = variable {
                    if !variable.variable_type.accepts(value) {
                        return Err(invalid(format!(
                            "Step {} input '{}' expects {}, got {}",
                            index, name, variable.variable_type, value
                        )));
                    }
                }
            }
            InputMapping::FromCache { from_cache } => {
                if from_cache.step >= index {
                    return Err(invalid(format!(
                        "Step {} input '{}' references step {}, only earlier steps can be referenced",
                        index, name, from_cache.step
                    )));
                }
                let source = spec.steps[from_cache.step].computation();
                let produced = source
                    .is_some_and(|c| c.computation.output.contains_key(&from_cache.variable));
                if !produced {
                    return Err(invalid(format!(
                        "Step {} input '{}' references variable '{}' which step {} does not output",
                        index, name, from_cache.variable, from_cache.step
                    )));
                }
            }
            InputMapping::Files { files } => {
                if files.source.trim().is_empty() {
                    return Err(invalid(format!(
                        "Step {} input '{}' has an empty files source",
                        index, name
                    )));
                }
            }
        }
    }

    for (name, variable) in declared {
        if !variable.optional && variable.default.is_none() && !step.input_map.contains_key(name) {
            return Err(invalid(format!(
                "Step {} required input '{}' is not mapped",
                index, name
            )));
        }
    }

    Ok(())
}

/// Validates a start request against the node it is started on
pub fn validate_request(request: &StartRequest, mode: RunMode) -> Result<()> {
    validate_run_id(&request.run_id)?;
    validate_spec(&request.spec)?;

    if request.timeout.is_some_and(|t| t.is_zero()) {
        return Err(invalid("Run timeout must be greater than zero"));
    }

    let mut clients = BTreeSet::new();
    for client in &request.clients {
        if client.trim().is_empty() {
            return Err(invalid("Client ids cannot be empty"));
        }
        if !clients.insert(client.as_str()) {
            return Err(invalid(format!("Client '{}' is listed twice", client)));
        }
    }
    if mode == RunMode::Remote && request.spec.is_decentralized() && request.clients.is_empty() {
        return Err(invalid(
            "An aggregator needs at least one client for decentralized steps",
        ));
    }

    if mode == RunMode::Local {
        for (index, step) in request.spec.steps.iter().enumerate() {
            for (name, mapping) in &step.input_map {
                if let InputMapping::Files { files } = mapping {
                    if !request.file_listings.contains_key(&files.source) {
                        return Err(invalid(format!(
                            "Step {} input '{}' reads files from unknown source '{}'",
                            index, name, files.source
                        )));
                    }
                }
            }
        }
    }

    if let Some(saved) = &request.saved_state {
        if saved.run_id != request.run_id {
            return Err(invalid(format!(
                "Saved state belongs to run '{}', not '{}'",
                saved.run_id, request.run_id
            )));
        }
        if saved.current_step >= request.spec.steps.len() {
            return Err(invalid(format!(
                "Saved state resumes at step {} but the pipeline has {} step(s)",
                saved.current_step,
                request.spec.steps.len()
            )));
        }
        if saved.cache.keys().any(|step| *step >= saved.current_step) {
            return Err(invalid("Saved state has cache entries for unfinished steps"));
        }
        if saved
            .checkpoint
            .as_ref()
            .is_some_and(|c| c.step != saved.current_step)
        {
            return Err(invalid("Saved checkpoint does not match the current step"));
        }
    }

    Ok(())
}

/// Run ids end up in directory names and topic names
fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.trim().is_empty() {
        return Err(invalid("Run id cannot be empty"));
    }
    if run_id == "." || run_id == ".." {
        return Err(invalid(format!("Run id '{}' is reserved", run_id)));
    }
    if !run_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(format!(
            "Run id '{}' may only contain letters, digits, '-', '_' and '.'",
            run_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinstac_core::dto::state::SuspendedRun;
    use serde_json::{Value as JsonValue, json};
    use std::collections::BTreeMap;

    fn computation(id: &str) -> JsonValue {
        json!({
            "meta": { "id": id, "name": id, "description": id, "repository": "r", "version": "1" },
            "computation": {
                "type": "cmd",
                "command": ["add"],
                "input": { "start": { "type": "number" } },
                "output": { "sum": { "type": "number" } },
                "remote": { "type": "cmd", "command": ["aggregate"] }
            }
        })
    }

    fn spec(steps: JsonValue) -> PipelineSpec {
        serde_json::from_value(json!({ "steps": steps })).unwrap()
    }

    fn two_steps(reference: usize) -> PipelineSpec {
        spec(json!([
            {
                "controller": { "type": "local" },
                "computations": [computation("a")],
                "inputMap": { "start": { "value": 1 } }
            },
            {
                "controller": { "type": "local" },
                "computations": [computation("b")],
                "inputMap": { "start": { "fromCache": { "step": reference, "variable": "sum" } } }
            }
        ]))
    }

    #[test]
    fn test_valid_spec() {
        assert!(validate_spec(&two_steps(0)).is_ok());
    }

    #[test]
    fn test_forward_and_self_references_rejected() {
        for reference in [1, 2] {
            let result = validate_spec(&two_steps(reference));
            assert!(matches!(result, Err(PipelineError::Validation(_))), "step {}", reference);
        }
    }

    #[test]
    fn test_reference_to_undeclared_output_rejected() {
        let spec = spec(json!([
            {
                "controller": { "type": "local" },
                "computations": [computation("a")],
                "inputMap": { "start": { "value": 1 } }
            },
            {
                "controller": { "type": "local" },
                "computations": [computation("b")],
                "inputMap": { "start": { "fromCache": { "step": 0, "variable": "mean" } } }
            }
        ]));
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("mean"));
    }

    #[test]
    fn test_step_rules() {
        assert!(validate_spec(&spec(json!([]))).is_err());

        let two_computations = spec(json!([{
            "controller": { "type": "local" },
            "computations": [computation("a"), computation("b")],
            "inputMap": { "start": { "value": 1 } }
        }]));
        assert!(validate_spec(&two_computations).is_err());

        let wrong_type = spec(json!([{
            "controller": { "type": "local" },
            "computations": [computation("a")],
            "inputMap": { "start": { "value": "one" } }
        }]));
        assert!(validate_spec(&wrong_type).is_err());

        let unmapped = spec(json!([{
            "controller": { "type": "local" },
            "computations": [computation("a")]
        }]));
        assert!(validate_spec(&unmapped).is_err());
    }

    #[test]
    fn test_decentralized_needs_remote_part() {
        let spec = spec(json!([{
            "controller": { "type": "decentralized" },
            "computations": [{
                "meta": { "id": "a", "name": "a", "description": "a", "repository": "r", "version": "1" },
                "computation": { "type": "docker", "dockerImage": "img", "command": ["run"] }
            }]
        }]));
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_request_rules() {
        let request = StartRequest::new(two_steps(0), "run-1");
        assert!(validate_request(&request, RunMode::Local).is_ok());

        let bad_id = StartRequest::new(two_steps(0), "../escape");
        assert!(validate_request(&bad_id, RunMode::Local).is_err());

        let duplicate_clients = StartRequest::new(two_steps(0), "run-1")
            .with_clients(vec!["alice".to_string(), "alice".to_string()]);
        assert!(validate_request(&duplicate_clients, RunMode::Remote).is_err());
    }

    #[test]
    fn test_aggregator_needs_clients() {
        let spec = spec(json!([{
            "controller": { "type": "decentralized" },
            "computations": [computation("a")],
            "inputMap": { "start": { "value": 1 } }
        }]));
        let request = StartRequest::new(spec, "run-1");
        assert!(validate_request(&request, RunMode::Remote).is_err());
        assert!(validate_request(&request, RunMode::Local).is_ok());
    }

    #[test]
    fn test_saved_state_must_match_run() {
        let saved = SuspendedRun {
            run_id: "other".to_string(),
            current_step: 1,
            checkpoint: None,
            cache: BTreeMap::new(),
        };
        let request = StartRequest::new(two_steps(0), "run-1").resume_from(saved.clone());
        assert!(validate_request(&request, RunMode::Local).is_err());

        let past_end = StartRequest::new(two_steps(0), "run-1").resume_from(SuspendedRun {
            run_id: "run-1".to_string(),
            current_step: 2,
            ..saved
        });
        assert!(validate_request(&past_end, RunMode::Local).is_err());
    }
}
