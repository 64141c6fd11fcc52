//! Aggregate testrun phase, skip propagation and the pause/cancel hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use super::guards::GuardContext;
use super::states::{StepPhase, TestrunPhase};
use super::step_state_machine::StepStateMachine;
use crate::metadata::Step;

/// Derive the testrun phase from its steps
///
/// Pure: identical step phases always give the identical result.
pub fn aggregate_phase(steps: &[Step]) -> TestrunPhase {
    if steps.iter().all(|step| step.phase == StepPhase::Pending) {
        return TestrunPhase::Pending;
    }
    if steps.iter().any(|step| !step.phase.is_terminal()) {
        return TestrunPhase::Running;
    }
    if steps.iter().any(|step| step.phase.is_failure()) {
        return TestrunPhase::Failed;
    }
    if steps
        .iter()
        .filter(|step| !step.system_step)
        .all(|step| step.phase == StepPhase::Succeeded)
    {
        return TestrunPhase::Succeeded;
    }
    TestrunPhase::Cancelled
}

/// Skip every `Pending` step downstream of `origin`
///
/// Returns the names of the steps that were skipped.
pub fn propagate_skips(steps: &mut [Step], origin: &str) -> Vec<String> {
    let mut skipped = Vec::new();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([origin.to_string()]);

    while let Some(upstream) = queue.pop_front() {
        for step in steps.iter_mut() {
            if !step.dependencies.iter().any(|dependency| *dependency == upstream) {
                continue;
            }
            if !visited.insert(step.name.clone()) {
                continue;
            }
            if StepStateMachine::new(&mut *step, GuardContext::default()).skip() {
                skipped.push(step.name.clone());
            }
            if step.phase.blocks_dependents() {
                queue.push_back(step.name.clone());
            }
        }
    }

    skipped
}

/// Skip every `Pending` step; running steps are left for the engine
pub fn skip_pending(steps: &mut [Step]) -> Vec<String> {
    steps
        .iter_mut()
        .filter_map(|step| {
            let skipped = StepStateMachine::new(&mut *step, GuardContext::default()).skip();
            skipped.then(|| step.name.clone())
        })
        .collect()
}

/// `Pending` steps whose dependencies all succeeded
pub fn ready_steps(steps: &[Step]) -> Vec<&str> {
    steps
        .iter()
        .filter(|step| step.phase == StepPhase::Pending)
        .filter(|step| {
            step.dependencies.iter().all(|dependency| {
                steps
                    .iter()
                    .find(|candidate| candidate.name == *dependency)
                    .is_some_and(|candidate| candidate.phase.satisfies_dependencies())
            })
        })
        .map(|step| step.name.as_str())
        .collect()
}

/// Level-triggered pause/cancel flags of a testrun
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl HoldState {
    /// Apply a pause; returns `false` while a pause is still in effect
    ///
    /// A pause that lapsed after `pause_timeout` is replaced by a fresh one.
    pub fn pause(&mut self, now: DateTime<Utc>, pause_timeout: Duration) -> bool {
        if self.paused_at.is_some() && self.is_held(now, pause_timeout) {
            return false;
        }
        self.paused_at = Some(now);
        true
    }

    /// Clear the pause; returns `false` when not paused
    pub fn resume(&mut self) -> bool {
        self.paused_at.take().is_some()
    }

    /// Pause and remember the cancel request; returns `false` when already cancelled
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        self.paused_at.get_or_insert(now);
        !std::mem::replace(&mut self.cancel_requested, true)
    }

    /// Whether not-yet-started steps are held back at `now`
    ///
    /// A cancelled run is held for good; a pause expires after `pause_timeout`.
    pub fn is_held(&self, now: DateTime<Utc>, pause_timeout: Duration) -> bool {
        if self.cancel_requested {
            return true;
        }
        match self.paused_at {
            Some(paused_at) => match chrono::Duration::from_std(pause_timeout) {
                Ok(timeout) => now < paused_at + timeout,
                Err(_) => true,
            },
            None => false,
        }
    }

    /// Whether a pause lapsed without a resume signal
    pub fn pause_expired(&self, now: DateTime<Utc>, pause_timeout: Duration) -> bool {
        self.paused_at.is_some() && !self.cancel_requested && !self.is_held(now, pause_timeout)
    }

    pub fn guard_context(&self) -> GuardContext {
        GuardContext {
            cancel_requested: self.cancel_requested,
        }
    }
}
