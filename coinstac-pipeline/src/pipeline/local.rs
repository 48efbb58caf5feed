use coinstac_core::domain::run::RunStatus;
use tracing::debug;

use super::state::StepState;
use super::step::{StepResult, StepRunner};
use crate::controller::{Controller, Decision, LocalController};
use crate::error::{PipelineError, Result};

impl StepRunner<'_> {
    /// Repeats the computation on its own output until the controller is done
    pub async fn run_local(&mut self, mut state: StepState) -> Result<StepResult> {
        let controller = LocalController::new(&self.step.controller.options);

        loop {
            if controller.pre_iteration(&state) == Decision::Done {
                break;
            }

            state.iteration += 1;
            self.report(&state, RunStatus::Running, vec![]);

            let output = self.invoke(&state).await?;
            self.stage(&output.data)?;

            let decision = controller.decide(&state, &output, None);
            debug!(
                "Run {} step {} iteration {}: {:?}",
                self.ctx.run_id, self.index, state.iteration, decision
            );

            state.absorb(output);
            self.control.save_checkpoint(state.checkpoint(self.ctx.mode));
            self.report(&state, RunStatus::Running, vec![]);

            match decision {
                Decision::Done => break,
                Decision::Repeat => continue,
                Decision::Cancel(reason) => return Err(PipelineError::container(reason)),
                other => return Err(self.unexpected(&other)),
            }
        }

        Ok(StepResult::from_state(&state))
    }
}
