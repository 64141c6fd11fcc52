use tracing::{debug, warn};

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::StepPhaseEvent,
    guards::{CancelRequestedGuard, GuardContext, TransitionGuard},
    states::StepPhase,
};
use crate::metadata::Step;

/// Result of feeding a phase into the step state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: StepPhase, to: StepPhase },
    /// Re-delivery of the current phase; nothing changed
    Duplicate,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// State machine for a single step
///
/// `Pending -> Running -> {Succeeded | Failed | Timeout}`. `Skipped` is
/// reached from `Pending`, or from `Running` once the run is cancelled.
/// A step that never started may also fail or time out directly.
pub struct StepStateMachine<'a> {
    step: &'a mut Step,
    context: GuardContext,
}

impl<'a> StepStateMachine<'a> {
    pub fn new(step: &'a mut Step, context: GuardContext) -> Self {
        Self { step, context }
    }

    pub fn current_phase(&self) -> StepPhase {
        self.step.phase
    }

    /// Apply an engine event to the step, copying its timing on success
    pub fn transition(&mut self, event: &StepPhaseEvent) -> StateMachineResult<TransitionOutcome> {
        let outcome = self.determine_outcome(event.phase)?;
        if let TransitionOutcome::Applied { from, to } = outcome {
            self.step.phase = to;
            if let Some(start_time) = event.start_time {
                self.step.start_time = Some(start_time);
            }
            if let Some(duration) = event.duration {
                self.step.duration = Some(duration);
            }
            if let Some(host_ref) = &event.host_ref {
                self.step.host_ref = Some(host_ref.clone());
            }
            debug!(step = %self.step.name, from = %from, to = %to, "Step phase applied");
        }
        Ok(outcome)
    }

    /// Move a `Pending` step to `Skipped`; other phases are left alone
    pub fn skip(&mut self) -> bool {
        if self.step.phase != StepPhase::Pending {
            return false;
        }
        self.step.phase = StepPhase::Skipped;
        true
    }

    /// Check the transition table and guards without changing the step
    pub fn determine_outcome(&self, target: StepPhase) -> StateMachineResult<TransitionOutcome> {
        let current = self.step.phase;
        if current == target {
            return Ok(TransitionOutcome::Duplicate);
        }

        let permitted = matches!(
            (current, target),
            (StepPhase::Pending, StepPhase::Running)
                | (StepPhase::Pending, StepPhase::Skipped)
                | (StepPhase::Pending, StepPhase::Failed)
                | (StepPhase::Pending, StepPhase::Timeout)
                | (StepPhase::Running, StepPhase::Succeeded)
                | (StepPhase::Running, StepPhase::Failed)
                | (StepPhase::Running, StepPhase::Timeout)
                | (StepPhase::Running, StepPhase::Skipped)
        );

        let invalid = || StateMachineError::InvalidTransition {
            step: self.step.name.clone(),
            from: current,
            to: target,
        };

        if !permitted {
            return Err(invalid());
        }

        let guard = CancelRequestedGuard;
        if let Err(error) = guard.check(&*self.step, target, &self.context) {
            warn!(
                step = %self.step.name,
                guard = guard.description(),
                error = %error,
                "Transition rejected by guard"
            );
            return Err(invalid());
        }

        Ok(TransitionOutcome::Applied {
            from: current,
            to: target,
        })
    }
}
