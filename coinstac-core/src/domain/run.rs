//! Run domain types

use serde::{Deserialize, Serialize};

/// Which side of a decentralized computation a node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// A participant holding its own data
    Local,
    /// The aggregator
    Remote,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Local => write!(f, "local"),
            RunMode::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(RunMode::Local),
            "remote" => Ok(RunMode::Remote),
            other => Err(format!("unknown run mode '{}'", other)),
        }
    }
}

/// Lifecycle of a run
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`. Terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingForPeers,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Failed | RunStatus::Cancelled) => true,
            (RunStatus::Running | RunStatus::WaitingForPeers, _) => next != RunStatus::Pending,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "Pending"),
            RunStatus::Running => write!(f, "Running"),
            RunStatus::WaitingForPeers => write!(f, "WaitingForPeers"),
            RunStatus::Completed => write!(f, "Completed"),
            RunStatus::Failed => write!(f, "Failed"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(!terminal.can_transition_to(RunStatus::Running));
            assert!(!terminal.can_transition_to(RunStatus::Failed));
        }
    }

    #[test]
    fn test_running_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::WaitingForPeers));
        assert!(RunStatus::WaitingForPeers.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_run_mode_from_str() {
        assert_eq!("Remote".parse::<RunMode>().unwrap(), RunMode::Remote);
        assert!("central".parse::<RunMode>().is_err());
    }
}
