//! Step input resolution and output contracts

use coinstac_core::domain::computation::VariableSpec;
use coinstac_core::domain::pipeline::{InputMapping, Step};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use tracing::warn;

use crate::cache::Cache;
use crate::error::{PipelineError, Result};

/// Builds a step's first input from its input map
///
/// Declared defaults come first, then every mapping: literal values as is,
/// cache references from committed steps only, file selections from the
/// run's listings.
pub fn resolve(
    step: &Step,
    index: usize,
    cache: &Cache,
    file_listings: &BTreeMap<String, Vec<String>>,
) -> Result<JsonValue> {
    let computation = step.computation().ok_or_else(|| {
        PipelineError::Validation(format!("step {} has no computation", index))
    })?;

    let mut input = Map::new();
    for (name, variable) in &computation.computation.input {
        if let Some(default) = &variable.default {
            input.insert(name.clone(), default.clone());
        }
    }

    for (name, mapping) in &step.input_map {
        let value = match mapping {
            InputMapping::Value { value } => value.clone(),
            InputMapping::FromCache { from_cache } => cache
                .get(from_cache.step, &from_cache.variable)
                .map_err(|_| PipelineError::UnresolvedReference {
                    step: index,
                    input: name.clone(),
                    from_step: from_cache.step,
                    variable: from_cache.variable.clone(),
                })?
                .clone(),
            InputMapping::Files { files } => {
                let listing = file_listings.get(&files.source);
                if listing.is_none() {
                    warn!("No file listing for source '{}', input '{}' is empty", files.source, name);
                }
                JsonValue::Array(
                    listing
                        .into_iter()
                        .flatten()
                        .filter(|file| files.matches(file))
                        .map(|file| JsonValue::String(file.clone()))
                        .collect(),
                )
            }
        };
        input.insert(name.clone(), value);
    }

    Ok(JsonValue::Object(input))
}

/// Checks a step's final output against its declared variables
///
/// `None` means the step finished without running its computation; the
/// output is then built from defaults. Missing variables take their default
/// when they have one.
pub fn enforce_output_contract(
    index: usize,
    declared: &BTreeMap<String, VariableSpec>,
    output: Option<JsonValue>,
) -> Result<JsonValue> {
    let violation = |message: String| PipelineError::OutputContract {
        step: index,
        message,
    };

    let mut object = match output {
        None => Map::new(),
        Some(value) if declared.is_empty() => return Ok(value),
        Some(JsonValue::Object(object)) => object,
        Some(other) => {
            return Err(violation(format!(
                "expected an object with declared outputs, got {}",
                other
            )));
        }
    };

    for (name, variable) in declared {
        match object.get(name) {
            Some(value) if !variable.variable_type.accepts(value) => {
                return Err(violation(format!(
                    "variable '{}' should be of type {}",
                    name, variable.variable_type
                )));
            }
            Some(_) => {}
            None => match &variable.default {
                Some(default) => {
                    object.insert(name.clone(), default.clone());
                }
                None if variable.optional => {}
                None => return Err(violation(format!("missing variable '{}'", name))),
            },
        }
    }

    Ok(JsonValue::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinstac_core::domain::computation::VariableType;
    use coinstac_core::domain::pipeline::FileSelector;
    use serde_json::json;

    fn step(input_map: BTreeMap<String, InputMapping>) -> Step {
        serde_json::from_value(json!({
            "controller": { "type": "local" },
            "computations": [{
                "meta": { "id": "a", "name": "a", "description": "a", "repository": "a", "version": "1" },
                "computation": {
                    "type": "cmd",
                    "command": ["true"],
                    "input": {
                        "start": { "type": "number" },
                        "scale": { "type": "number", "default": 2 }
                    }
                }
            }],
            "inputMap": serde_json::to_value(input_map).unwrap()
        }))
        .unwrap()
    }

    #[test]
    fn test_literal_and_default() {
        let step = step(BTreeMap::from([(
            "start".to_string(),
            InputMapping::value(json!(1)),
        )]));

        let input = resolve(&step, 0, &Cache::new(), &BTreeMap::new()).unwrap();
        assert_eq!(input, json!({ "start": 1, "scale": 2 }));
    }

    #[test]
    fn test_cache_reference() {
        let step = step(BTreeMap::from([(
            "start".to_string(),
            InputMapping::from_cache(0, "sum"),
        )]));

        let mut cache = Cache::new();
        cache.put(0, "sum", json!(3)).unwrap();

        // Staged but not committed is not resolvable
        let err = resolve(&step, 1, &cache, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedReference { from_step: 0, .. }));

        cache.commit(0).unwrap();
        let input = resolve(&step, 1, &cache, &BTreeMap::new()).unwrap();
        assert_eq!(input["start"], 3);
    }

    #[test]
    fn test_file_selection() {
        let step = step(BTreeMap::from([(
            "start".to_string(),
            InputMapping::Files {
                files: FileSelector {
                    source: "site".to_string(),
                    extensions: vec!["csv".to_string()],
                },
            },
        )]));
        let listings = BTreeMap::from([(
            "site".to_string(),
            vec!["a.csv".to_string(), "notes.txt".to_string(), "b.csv".to_string()],
        )]);

        let input = resolve(&step, 0, &Cache::new(), &listings).unwrap();
        assert_eq!(input["start"], json!(["a.csv", "b.csv"]));
    }

    #[test]
    fn test_contract_fills_defaults_for_zero_iterations() {
        let declared = BTreeMap::from([(
            "sum".to_string(),
            VariableSpec::of(VariableType::Number).with_default(json!(0)),
        )]);
        assert_eq!(
            enforce_output_contract(0, &declared, None).unwrap(),
            json!({ "sum": 0 })
        );

        let strict = BTreeMap::from([("sum".to_string(), VariableSpec::of(VariableType::Number))]);
        assert!(matches!(
            enforce_output_contract(0, &strict, None),
            Err(PipelineError::OutputContract { step: 0, .. })
        ));
    }

    #[test]
    fn test_contract_checks_types() {
        let declared = BTreeMap::from([("sum".to_string(), VariableSpec::of(VariableType::Number))]);

        assert!(enforce_output_contract(0, &declared, Some(json!({ "sum": 5 }))).is_ok());
        assert!(enforce_output_contract(0, &declared, Some(json!({ "sum": "5" }))).is_err());
        assert!(enforce_output_contract(0, &declared, Some(json!([5]))).is_err());
    }

    #[test]
    fn test_undeclared_output_passes_through() {
        let output = enforce_output_contract(0, &BTreeMap::new(), Some(json!([1, 2]))).unwrap();
        assert_eq!(output, json!([1, 2]));
    }
}
