//! Step controllers
//!
//! A controller is consulted once before and once after every iteration of a
//! step and answers what happens next. It never runs anything itself.

pub mod decentralized;
pub mod group;
pub mod local;

pub use decentralized::DecentralizedController;
pub use group::{Contribution, GroupSync};
pub use local::LocalController;

use coinstac_core::dto::transport::RemoteResult;

use crate::driver::ComputationOutput;
use crate::pipeline::state::StepState;

/// What a step does next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Every participant is in: move the shared counter and aggregate
    Advance,
    /// Run the step's computation (again)
    Repeat,
    /// Keep collecting contributions
    WaitForPeers,
    /// The step is finished
    Done,
    /// Abort the run
    Cancel(String),
}

pub trait Controller: Send + Sync {
    /// Asked before each iteration, answers `Repeat` or `Done`
    fn pre_iteration(&self, state: &StepState) -> Decision;

    /// Asked after each iteration with its output and, on a participant,
    /// the aggregator's answer
    fn decide(
        &self,
        state: &StepState,
        latest: &ComputationOutput,
        remote: Option<&RemoteResult>,
    ) -> Decision;
}

/// Fixed iteration limit shared by both controllers
fn limit_reached(max_iterations: Option<u32>, state: &StepState) -> bool {
    max_iterations.is_some_and(|max| state.iteration >= max)
}
