use super::errors::{guard_failed, StateMachineResult};
use super::states::StepPhase;
use crate::metadata::Step;

/// Run level facts a guard may consult
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardContext {
    pub cancel_requested: bool,
}

/// Additional condition on a table-permitted transition
pub trait TransitionGuard {
    fn check(&self, step: &Step, target: StepPhase, context: &GuardContext)
        -> StateMachineResult<()>;

    /// Description of the guard for logging
    fn description(&self) -> &'static str;
}

/// A running step may only be reconciled to `Skipped` after a cancel request
pub struct CancelRequestedGuard;

impl TransitionGuard for CancelRequestedGuard {
    fn check(
        &self,
        step: &Step,
        target: StepPhase,
        context: &GuardContext,
    ) -> StateMachineResult<()> {
        if step.phase == StepPhase::Running
            && target == StepPhase::Skipped
            && !context.cancel_requested
        {
            return Err(guard_failed(format!(
                "step {} is running and the testrun was not cancelled",
                step.name
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Running steps are skipped only when the testrun is cancelled"
    }
}
