use coinstac_core::domain::pipeline::ControllerOptions;
use coinstac_core::dto::transport::RemoteResult;

use super::{Controller, Decision, limit_reached};
use crate::driver::ComputationOutput;
use crate::pipeline::state::StepState;

/// Repeats a computation on its own output until it reports success
#[derive(Debug, Clone, Default)]
pub struct LocalController {
    max_iterations: Option<u32>,
}

impl LocalController {
    pub fn new(options: &ControllerOptions) -> Self {
        Self {
            max_iterations: options.max_iterations,
        }
    }
}

impl Controller for LocalController {
    fn pre_iteration(&self, state: &StepState) -> Decision {
        if limit_reached(self.max_iterations, state) {
            Decision::Done
        } else {
            Decision::Repeat
        }
    }

    fn decide(
        &self,
        state: &StepState,
        latest: &ComputationOutput,
        _remote: Option<&RemoteResult>,
    ) -> Decision {
        if latest.success || limit_reached(self.max_iterations, state) {
            Decision::Done
        } else {
            Decision::Repeat
        }
    }
}
