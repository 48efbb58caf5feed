//! Error types for pipeline execution

use serde_json::json;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by the manager and by running pipelines
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// The pipeline or a computation definition is malformed
    #[error("Invalid pipeline specification: {0}")]
    Validation(String),

    /// A run with this id is already active
    #[error("Pipeline run '{0}' is already active")]
    DuplicateRun(String),

    /// No active run with this id
    #[error("No active pipeline run '{0}'")]
    NotFound(String),

    /// A `fromCache` input points at a variable nobody produced
    #[error("Step {step} input '{input}' references step {from_step} variable '{variable}' which was never produced")]
    UnresolvedReference {
        step: usize,
        input: String,
        from_step: usize,
        variable: String,
    },

    /// Computation output does not satisfy its declared output schema
    #[error("Step {step} output violates its contract: {message}")]
    OutputContract { step: usize, message: String },

    /// The computation crashed, exited non-zero or printed garbage
    #[error("Computation failed: {message}")]
    Container {
        message: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Peers did not answer in time
    #[error("Timed out after {waited_ms}ms waiting for {waiting_on}")]
    Timeout { waited_ms: u64, waiting_on: String },

    /// Publishing or receiving over the transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The run was stopped by a user or operator
    #[error("Pipeline run cancelled: {reason}")]
    Cancelled { reason: String },

    /// Manager configuration or environment is unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// A run task died unexpectedly
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a container error without process details
    pub fn container(message: impl Into<String>) -> Self {
        Self::Container {
            message: message.into(),
            exit_code: None,
            stderr: String::new(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Cancellation is the only terminal rejection that is not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_cancelled()
    }

    /// Short machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::DuplicateRun(_) => "duplicateRun",
            Self::NotFound(_) => "notFound",
            Self::UnresolvedReference { .. } => "unresolvedReference",
            Self::OutputContract { .. } => "outputContract",
            Self::Container { .. } => "container",
            Self::Timeout { .. } => "timeout",
            Self::Transport(_) => "transport",
            Self::Cancelled { .. } => "cancelled",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Detail payload for terminal state events
    pub fn to_detail(&self) -> serde_json::Value {
        json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_failure() {
        let err = PipelineError::cancelled("user");
        assert!(err.is_cancelled());
        assert!(!err.is_failure());
        assert!(PipelineError::container("boom").is_failure());
    }

    #[test]
    fn test_detail_carries_kind() {
        let err = PipelineError::Timeout {
            waited_ms: 50,
            waiting_on: "bob".to_string(),
        };
        let detail = err.to_detail();
        assert_eq!(detail["kind"], "timeout");
        assert!(detail["message"].as_str().unwrap().contains("bob"));
    }

    #[test]
    fn test_unresolved_reference_message() {
        let err = PipelineError::UnresolvedReference {
            step: 1,
            input: "start".to_string(),
            from_step: 0,
            variable: "sum".to_string(),
        };
        assert!(err.to_string().contains("variable 'sum'"));
    }
}
