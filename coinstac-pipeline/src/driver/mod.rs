//! Container driver
//!
//! The boundary between the pipeline and whatever actually executes a
//! computation. The pipeline hands over an [`Invocation`] and gets back a
//! parsed [`ComputationOutput`]; it never sees processes or containers.

mod podman;

pub use podman::PodmanDriver;

use async_trait::async_trait;
use coinstac_core::domain::computation::ComputationKind;
use coinstac_core::domain::run::RunMode;
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;

use crate::context::RunDirectories;
use crate::error::{PipelineError, Result};

/// One execution of a computation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub run_id: String,
    pub client_id: String,
    pub mode: RunMode,
    pub step: usize,
    pub iteration: u32,
    pub kind: ComputationKind,
    pub input: JsonValue,
    /// The computation's private cache from its previous iteration
    pub cache: JsonValue,
    pub directories: RunDirectories,
}

impl Invocation {
    /// The JSON document written to the computation's stdin
    pub fn envelope(&self) -> JsonValue {
        json!({
            "input": self.input,
            "cache": self.cache,
            "state": {
                "runId": self.run_id,
                "clientId": self.client_id,
                "mode": self.mode,
                "iteration": self.iteration,
                "baseDirectory": self.directories.input,
                "outputDirectory": self.directories.output,
                "transferDirectory": self.directories.transfer,
            }
        })
    }

    /// Unique per node, so simulated participants sharing one container
    /// runtime never collide
    pub fn container_name(&self) -> String {
        format!(
            "coinstac-{}-{}-{}-{}-{}",
            sanitize(&self.run_id),
            sanitize(&self.client_id),
            self.mode,
            self.step,
            self.iteration
        )
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// What a computation printed, parsed
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationOutput {
    /// The computation considers its work finished
    pub success: bool,
    pub data: JsonValue,
    /// Private cache to hand to the next iteration
    pub cache: Option<JsonValue>,
    pub stderr: String,
}

impl ComputationOutput {
    pub fn finished(data: JsonValue) -> Self {
        Self {
            success: true,
            data,
            cache: None,
            stderr: String::new(),
        }
    }

    pub fn unfinished(data: JsonValue) -> Self {
        Self {
            success: false,
            ..Self::finished(data)
        }
    }

    pub fn with_cache(mut self, cache: JsonValue) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Parses a computation's stdout
    ///
    /// Expects `{"output": ..., "success": bool, "cache": ...}`. A missing
    /// `success` reads as `false` and an object without `output` is the
    /// output itself. When stdout carries log lines before the result, the
    /// last non-empty line is tried.
    pub fn parse(stdout: &str, stderr: String) -> Result<Self> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::Container {
                message: "Computation produced no output".to_string(),
                exit_code: Some(0),
                stderr,
            });
        }

        let parsed = serde_json::from_str::<JsonValue>(trimmed).or_else(|first| {
            trimmed
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .and_then(|line| serde_json::from_str::<JsonValue>(line.trim()).ok())
                .ok_or(first)
        });

        let mut object = match parsed {
            Ok(JsonValue::Object(object)) => object,
            Ok(other) => {
                return Err(PipelineError::Container {
                    message: format!("Computation output is not a JSON object: {}", other),
                    exit_code: Some(0),
                    stderr,
                });
            }
            Err(e) => {
                return Err(PipelineError::Container {
                    message: format!("Computation output is not valid JSON: {}", e),
                    exit_code: Some(0),
                    stderr,
                });
            }
        };

        let success = object
            .get("success")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let cache = object.remove("cache");
        let data = match object.remove("output") {
            Some(output) => output,
            None => {
                object.remove("success");
                JsonValue::Object(object)
            }
        };

        Ok(Self {
            success,
            data,
            cache,
            stderr,
        })
    }
}

/// Runs computations and fetches their images
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Runs one invocation to completion
    ///
    /// Must return `PipelineError::Cancelled` promptly once `cancel` fires,
    /// after asking the running computation to stop.
    async fn run(&self, invocation: Invocation, cancel: CancellationToken) -> Result<ComputationOutput>;

    /// Makes sure every image is available locally
    async fn pull_images(&self, images: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn invocation() -> Invocation {
        Invocation {
            run_id: "run/1".to_string(),
            client_id: "alice".to_string(),
            mode: RunMode::Local,
            step: 0,
            iteration: 2,
            kind: ComputationKind::Cmd {
                command: vec!["true".to_string()],
            },
            input: json!({ "start": 1 }),
            cache: json!({}),
            directories: RunDirectories::new(Path::new("/data"), "alice", "run-1"),
        }
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = invocation().envelope();
        assert_eq!(envelope["input"]["start"], 1);
        assert_eq!(envelope["state"]["mode"], "local");
        assert_eq!(envelope["state"]["iteration"], 2);
        assert_eq!(envelope["state"]["baseDirectory"], "/data/input/alice/run-1");
    }

    #[test]
    fn test_container_name_is_sanitized() {
        assert_eq!(invocation().container_name(), "coinstac-run-1-alice-local-0-2");
    }

    #[test]
    fn test_container_names_differ_per_node() {
        let site_1 = Invocation {
            client_id: "site-1".to_string(),
            ..invocation()
        };
        let site_2 = Invocation {
            client_id: "site-2".to_string(),
            ..invocation()
        };
        let aggregator = Invocation {
            client_id: "site-1".to_string(),
            mode: RunMode::Remote,
            ..invocation()
        };

        assert_ne!(site_1.container_name(), site_2.container_name());
        assert_ne!(site_1.container_name(), aggregator.container_name());
    }

    #[test]
    fn test_parse_full_envelope() {
        let out = ComputationOutput::parse(
            r#"{"output": {"sum": 3}, "success": true, "cache": {"seen": 1}}"#,
            String::new(),
        )
        .unwrap();
        assert!(out.success);
        assert_eq!(out.data, json!({ "sum": 3 }));
        assert_eq!(out.cache, Some(json!({ "seen": 1 })));
    }

    #[test]
    fn test_parse_bare_object_defaults_to_unfinished() {
        let out = ComputationOutput::parse(r#"{"sum": 3}"#, String::new()).unwrap();
        assert!(!out.success);
        assert_eq!(out.data, json!({ "sum": 3 }));
    }

    #[test]
    fn test_parse_skips_leading_log_lines() {
        let out = ComputationOutput::parse(
            "loading model\n{\"output\": {\"beta\": [1]}, \"success\": true}\n",
            String::new(),
        )
        .unwrap();
        assert_eq!(out.data, json!({ "beta": [1] }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = ComputationOutput::parse("not json", "trace".to_string()).unwrap_err();
        match err {
            PipelineError::Container { stderr, .. } => assert_eq!(stderr, "trace"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(ComputationOutput::parse("", String::new()).is_err());
        assert!(ComputationOutput::parse("[1, 2]", String::new()).is_err());
    }
}
