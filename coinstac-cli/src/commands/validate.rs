use anyhow::{Context, Result};
use colored::*;
use coinstac_core::domain::pipeline::PipelineSpec;
use coinstac_pipeline::validation::validate_spec;
use std::path::Path;

use super::load_spec;

pub fn handle_validate(path: &Path) -> Result<()> {
    let spec = load_spec(path)?;
    validate_spec(&spec).context("Pipeline is invalid")?;

    println!("{}", "✓ Pipeline is valid".green().bold());
    print_steps(&spec);
    Ok(())
}

/// Print one line per step
pub(crate) fn print_steps(spec: &PipelineSpec) {
    for (index, step) in spec.steps.iter().enumerate() {
        let controller = step
            .controller
            .resolved_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        let computation = step
            .computation()
            .map(|c| format!("{} {}", c.meta.name, c.meta.version))
            .unwrap_or_default();

        let inputs = if step.input_map.is_empty() {
            String::new()
        } else {
            format!(
                "inputs: {}",
                step.input_map.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        };

        println!(
            "  {} {} {} {}",
            format!("{}.", index).dimmed(),
            computation.bold(),
            format!("[{}]", controller).cyan(),
            inputs.dimmed()
        );
    }
}
