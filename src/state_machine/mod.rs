//! # Run State Tracking
//!
//! Per-step state machine, the aggregate testrun phase and the hold flags
//! used for pause, resume and cancel.

pub mod errors;
pub mod events;
pub mod guards;
pub mod states;
pub mod step_state_machine;
pub mod testrun_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::{RunSignal, StepPhaseEvent};
pub use guards::{CancelRequestedGuard, GuardContext, TransitionGuard};
pub use states::{StepPhase, TestrunPhase};
pub use step_state_machine::{StepStateMachine, TransitionOutcome};
pub use testrun_state_machine::{
    aggregate_phase, propagate_skips, ready_steps, skip_pending, HoldState,
};
