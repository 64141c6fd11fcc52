//! # Orchestration
//!
//! Event-driven core that turns engine events into testrun phases, retries
//! failed runs and persists their results.
//!
//! ## Core Components
//!
//! - **RunStateTracker**: single writer of step and testrun phases, one async mutex per testrun
//! - **RetryCoordinator**: spawns at most one successor per failed testrun within the retry budget
//! - **ResultCollector**: deduplicating summary builder with bounded persistence retries
//! - **Orchestrator**: entry point wiring the components, with a background collector worker

pub mod backoff;
pub mod orchestrator;
pub mod result_collector;
pub mod retry_coordinator;
pub mod tracker;

pub use backoff::{retry_with_backoff, BackoffPolicy, RetryOutcome};
pub use orchestrator::{Collaborators, EventHandled, Orchestrator, Submission};
pub use result_collector::{step_summary_key, CollectOutcome, ResultCollector};
pub use retry_coordinator::{RetryCoordinator, RetryDecision, RetryOverrides};
pub use tracker::{
    terminal_steps, AnnotationSync, EventDisposition, EventReport, RunStateTracker, SignalReport,
};
