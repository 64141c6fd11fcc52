use thiserror::Error;

use super::states::StepPhase;

/// Errors of the per-step and per-run state machines
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    /// Out-of-order or post-terminal transition; surfaced as a warning, never retried
    #[error("Invalid transition of step {step} from {from} to {to}")]
    InvalidTransition {
        step: String,
        from: StepPhase,
        to: StepPhase,
    },

    #[error("Testrun {testrun} has no step named {step}")]
    UnknownStep { testrun: String, step: String },

    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },
}

impl StateMachineError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

/// Helper for guard rejections
pub fn guard_failed(reason: impl Into<String>) -> StateMachineError {
    StateMachineError::GuardFailed {
        reason: reason.into(),
    }
}
