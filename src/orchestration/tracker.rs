//! # Run State Tracker
//!
//! Single writer for the phase and timing of every testrun. Each testrun has
//! its own async mutex in a sharded map, so events of one run are applied one
//! at a time while different runs proceed independently.
//!
//! Writes to the testrun store are optimistic. On a version conflict the
//! tracker re-reads the record, which brings in annotations an operator
//! edited meanwhile, re-applies its change on top and tries again a bounded
//! number of times.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::TrackerConfig;
use crate::constants::{events, AnnotationKeys};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::logging::{log_step_operation, log_testrun_operation};
use crate::metadata::{ConditionKind, Step, Testrun};
use crate::state_machine::{
    aggregate_phase, propagate_skips, ready_steps, skip_pending, RunSignal, StateMachineError,
    StepPhase, StepPhaseEvent, StepStateMachine, TestrunPhase, TransitionOutcome,
};
use crate::store::{StoreError, TestrunStore, Versioned};

#[derive(Debug, Default)]
struct RunSlot {
    record: Option<Versioned<Testrun>>,
}

/// What happened to a single engine event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    Applied { from: StepPhase, to: StepPhase },
    Duplicate,
    /// Contract violation; recorded as a condition, stored phase unchanged
    Rejected(StateMachineError),
}

/// Result of applying an engine event
#[derive(Debug, Clone)]
pub struct EventReport {
    pub disposition: EventDisposition,
    /// Steps skipped because of the event
    pub skipped: Vec<String>,
    pub previous_phase: TestrunPhase,
    pub testrun: Testrun,
}

impl EventReport {
    pub fn is_applied(&self) -> bool {
        matches!(self.disposition, EventDisposition::Applied { .. })
    }

    pub fn phase_changed(&self) -> bool {
        self.previous_phase != self.testrun.phase
    }

    /// The run settled with this event
    pub fn became_terminal(&self) -> bool {
        self.phase_changed() && self.testrun.phase.is_terminal()
    }
}

/// Result of a pause, resume or cancel signal
#[derive(Debug, Clone)]
pub struct SignalReport {
    pub signal: RunSignal,
    /// `false` when the signal was already in effect
    pub changed: bool,
    pub skipped: Vec<String>,
    pub previous_phase: TestrunPhase,
    pub testrun: Testrun,
}

impl SignalReport {
    pub fn became_terminal(&self) -> bool {
        self.previous_phase != self.testrun.phase && self.testrun.phase.is_terminal()
    }
}

/// Result of syncing annotations onto a testrun record
#[derive(Debug, Clone)]
pub struct AnnotationSync {
    pub resumed: bool,
    pub collect_requested: bool,
    pub testrun: Testrun,
}

pub struct RunStateTracker {
    store: Arc<dyn TestrunStore>,
    publisher: EventPublisher,
    config: TrackerConfig,
    keys: &'static AnnotationKeys,
    runs: DashMap<String, Arc<Mutex<RunSlot>>>,
}

impl RunStateTracker {
    pub fn new(store: Arc<dyn TestrunStore>, publisher: EventPublisher, config: TrackerConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            keys: AnnotationKeys::standard(),
            runs: DashMap::new(),
        }
    }

    /// Store a new testrun and start tracking it
    pub async fn register(&self, testrun: Testrun) -> Result<Testrun> {
        let slot = self.slot(&testrun.id);
        let mut slot = slot.lock().await;
        let created = self.store.create(testrun).await?;
        let testrun = created.value.clone();
        slot.record = Some(created);

        log_testrun_operation(
            "register",
            &testrun.id,
            testrun.execution_group.as_deref(),
            testrun.phase.as_str(),
            testrun.previous_attempt.as_deref(),
        );
        self.publisher.publish_testrun_event(
            events::TESTRUN_SUBMITTED,
            &testrun.id,
            json!({
                "steps": testrun.steps.len(),
                "retries": testrun.retries,
                "previousAttempt": testrun.previous_attempt,
            }),
        );
        Ok(testrun)
    }

    /// Current record as stored
    pub async fn get(&self, id: &str) -> Result<Testrun> {
        Ok(self.store.get(id).await?.value)
    }

    /// Apply a step phase event
    ///
    /// Invalid transitions never fail the call; they are reported in the
    /// disposition and attached to the testrun as a condition.
    pub async fn apply_event(&self, event: &StepPhaseEvent) -> Result<EventReport> {
        let (result, testrun) = self
            .mutate(&event.testrun_id, |testrun| {
                let now = Utc::now();
                let previous_phase = testrun.phase;
                let context = testrun.hold.guard_context();

                let outcome = match testrun.step_mut(&event.step_name) {
                    Some(step) => StepStateMachine::new(step, context).transition(event),
                    None => Err(StateMachineError::UnknownStep {
                        testrun: event.testrun_id.clone(),
                        step: event.step_name.clone(),
                    }),
                };

                match outcome {
                    Ok(TransitionOutcome::Duplicate) => {
                        ((EventDisposition::Duplicate, Vec::new(), previous_phase), false)
                    }
                    Ok(TransitionOutcome::Applied { from, to }) => {
                        if testrun.start_time.is_none() {
                            testrun.start_time = Some(event.start_time.unwrap_or(now));
                        }
                        let skipped = if to.blocks_dependents() {
                            propagate_skips(&mut testrun.steps, &event.step_name)
                        } else {
                            Vec::new()
                        };
                        refresh_phase(testrun, now);
                        (
                            (EventDisposition::Applied { from, to }, skipped, previous_phase),
                            true,
                        )
                    }
                    Err(error) => {
                        let message = error.to_string();
                        let known = testrun.conditions.iter().any(|condition| {
                            condition.kind == ConditionKind::InvalidTransition
                                && condition.message == message
                        });
                        if !known {
                            testrun.add_condition(ConditionKind::InvalidTransition, message);
                        }
                        (
                            (EventDisposition::Rejected(error), Vec::new(), previous_phase),
                            !known,
                        )
                    }
                }
            })
            .await?;

        let (disposition, skipped, previous_phase) = result;
        let report = EventReport {
            disposition,
            skipped,
            previous_phase,
            testrun,
        };
        self.announce_event(event, &report);
        Ok(report)
    }

    /// Apply a pause, resume or cancel signal; re-applying a signal is a no-op
    pub async fn signal(&self, id: &str, signal: RunSignal) -> Result<SignalReport> {
        let pause_timeout = self.config.pause_timeout();
        let (result, testrun) = self
            .mutate(id, |testrun| {
                let now = Utc::now();
                let previous_phase = testrun.phase;
                let (changed, skipped) = match signal {
                    RunSignal::Pause => (testrun.hold.pause(now, pause_timeout), Vec::new()),
                    RunSignal::Resume => (testrun.hold.resume(), Vec::new()),
                    RunSignal::Cancel => {
                        let cancelled = testrun.hold.cancel(now);
                        let skipped = skip_pending(&mut testrun.steps);
                        refresh_phase(testrun, now);
                        (cancelled || !skipped.is_empty(), skipped)
                    }
                };
                ((changed, skipped, previous_phase), changed)
            })
            .await?;

        let (changed, skipped, previous_phase) = result;
        let report = SignalReport {
            signal,
            changed,
            skipped,
            previous_phase,
            testrun,
        };

        if report.changed {
            let name = match signal {
                RunSignal::Pause => events::TESTRUN_PAUSED,
                RunSignal::Resume => events::TESTRUN_RESUMED,
                RunSignal::Cancel => events::TESTRUN_CANCELLED,
            };
            log_testrun_operation(
                signal.signal_type(),
                id,
                report.testrun.execution_group.as_deref(),
                report.testrun.phase.as_str(),
                None,
            );
            self.publisher
                .publish_testrun_event(name, id, json!({ "skipped": report.skipped }));
            for step in &report.skipped {
                self.publisher
                    .publish_step_event(events::STEP_SKIPPED, id, step, json!({ "reason": "cancelled" }));
            }
            self.announce_phase_change(&report.testrun, report.previous_phase);
        }
        Ok(report)
    }

    /// Merge externally set annotations and react to the trigger annotations
    ///
    /// The resume and collect triggers are consumed: they are removed from
    /// the record once recognised.
    pub async fn sync_annotations(
        &self,
        id: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<AnnotationSync> {
        let keys = self.keys;
        let ((resumed, collect_requested), testrun) = self
            .mutate(id, |testrun| {
                let mut changed = false;
                for (key, value) in annotations {
                    if testrun.annotations.get(key) != Some(value) {
                        testrun.annotations.insert(key.clone(), value.clone());
                        changed = true;
                    }
                }

                let resume_requested = take_trigger(&mut testrun.annotations, keys.resume_testrun);
                let collect_requested =
                    take_trigger(&mut testrun.annotations, keys.collect_testrun);
                let resumed = resume_requested && testrun.hold.resume();

                changed |= resume_requested || collect_requested;
                ((resumed, collect_requested), changed)
            })
            .await?;

        if resumed {
            log_testrun_operation(
                "resume",
                id,
                testrun.execution_group.as_deref(),
                testrun.phase.as_str(),
                Some("resume annotation"),
            );
            self.publisher
                .publish_testrun_event(events::TESTRUN_RESUMED, id, json!({ "source": "annotation" }));
        }

        Ok(AnnotationSync {
            resumed,
            collect_requested,
            testrun,
        })
    }

    /// Steps the engine may start now; empty while the run is held
    pub async fn ready_steps(&self, id: &str) -> Result<Vec<String>> {
        let testrun = self.get(id).await?;
        Ok(self.ready_steps_at(&testrun, Utc::now()))
    }

    pub fn ready_steps_at(&self, testrun: &Testrun, now: DateTime<Utc>) -> Vec<String> {
        let pause_timeout = self.config.pause_timeout();
        if testrun.hold.is_held(now, pause_timeout) {
            return Vec::new();
        }
        if testrun.hold.pause_expired(now, pause_timeout) {
            debug!(testrun_id = %testrun.id, "Pause expired without resume signal");
        }
        ready_steps(&testrun.steps)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Attach a condition unless one of the same kind and message exists
    pub async fn record_condition(
        &self,
        id: &str,
        kind: ConditionKind,
        message: impl Into<String>,
    ) -> Result<Testrun> {
        let message = message.into();
        let (_, testrun) = self
            .mutate(id, |testrun| {
                let known = testrun
                    .conditions
                    .iter()
                    .any(|condition| condition.kind == kind && condition.message == message);
                if !known {
                    testrun.add_condition(kind, message.clone());
                }
                ((), !known)
            })
            .await?;
        Ok(testrun)
    }

    /// Drop the cached record of a settled testrun
    ///
    /// A slot still held by an in-flight call stays, so a run never has two
    /// mutexes at once.
    pub fn evict(&self, id: &str) -> bool {
        self.runs
            .remove_if(id, |_, slot| Arc::strong_count(slot) == 1)
            .is_some()
    }

    pub fn tracked_runs(&self) -> usize {
        self.runs.len()
    }

    fn slot(&self, id: &str) -> Arc<Mutex<RunSlot>> {
        self.runs.entry(id.to_string()).or_default().clone()
    }

    /// Read-modify-write under the run's mutex with optimistic store updates
    ///
    /// `change` returns its result and whether it modified the record. It may
    /// run several times, each time on a freshly read record.
    async fn mutate<R, F>(&self, id: &str, mut change: F) -> Result<(R, Testrun)>
    where
        F: FnMut(&mut Testrun) -> (R, bool),
    {
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        let mut current = match slot.record.take() {
            Some(record) => record,
            None => self.store.get(id).await?,
        };

        let mut conflicts = 0;
        loop {
            let mut working = current.value.clone();
            let (result, changed) = change(&mut working);
            if !changed {
                slot.record = Some(current);
                return Ok((result, working));
            }

            match self.store.update(working, current.version).await {
                Ok(updated) => {
                    let testrun = updated.value.clone();
                    slot.record = Some(updated);
                    return Ok((result, testrun));
                }
                Err(StoreError::Conflict {
                    expected, actual, ..
                }) if conflicts < self.config.store_conflict_retries => {
                    conflicts += 1;
                    debug!(
                        testrun_id = %id,
                        expected = expected,
                        actual = actual,
                        attempt = conflicts,
                        "Testrun record changed concurrently, re-reading"
                    );
                    current = self.store.get(id).await?;
                }
                Err(error @ StoreError::Conflict { .. }) => {
                    warn!(
                        testrun_id = %id,
                        attempts = conflicts + 1,
                        "Testrun record kept changing concurrently, giving up"
                    );
                    slot.record = self.flag_conflict(id, conflicts + 1).await;
                    return Err(error.into());
                }
                Err(error) => {
                    warn!(testrun_id = %id, error = %error, "Failed to update testrun record");
                    return Err(error.into());
                }
            }
        }
    }

    /// Attach a `StoreConflict` condition to the latest record, best effort
    async fn flag_conflict(&self, id: &str, attempts: u32) -> Option<Versioned<Testrun>> {
        let message = format!("update abandoned after {attempts} conflicting writes");
        let mut latest = self.store.get(id).await.ok()?;
        if latest.value.has_condition(ConditionKind::StoreConflict) {
            return Some(latest);
        }

        latest.value.add_condition(ConditionKind::StoreConflict, message);
        match self.store.update(latest.value, latest.version).await {
            Ok(updated) => Some(updated),
            Err(error) => {
                debug!(testrun_id = %id, error = %error, "Could not record store conflict");
                None
            }
        }
    }

    fn announce_event(&self, event: &StepPhaseEvent, report: &EventReport) {
        let id = &event.testrun_id;
        match &report.disposition {
            EventDisposition::Applied { from, to } => {
                log_step_operation("transition", id, &event.step_name, to.as_str(), None);
                self.publisher.publish_step_event(
                    events::STEP_PHASE_CHANGED,
                    id,
                    &event.step_name,
                    json!({ "from": from, "to": to, "hostRef": event.host_ref }),
                );
                for step in &report.skipped {
                    self.publisher.publish_step_event(
                        events::STEP_SKIPPED,
                        id,
                        step,
                        json!({ "reason": "upstream", "upstream": event.step_name }),
                    );
                }
                self.announce_phase_change(&report.testrun, report.previous_phase);
            }
            EventDisposition::Duplicate => {
                debug!(
                    testrun_id = %id,
                    step = %event.step_name,
                    phase = %event.phase,
                    "Duplicate step event ignored"
                );
            }
            EventDisposition::Rejected(error) => {
                warn!(
                    testrun_id = %id,
                    step = %event.step_name,
                    phase = %event.phase,
                    error = %error,
                    "Rejected step event"
                );
                self.publisher.publish_step_event(
                    events::STEP_TRANSITION_REJECTED,
                    id,
                    &event.step_name,
                    json!({ "phase": event.phase, "error": error.to_string() }),
                );
            }
        }
    }

    fn announce_phase_change(&self, testrun: &Testrun, previous_phase: TestrunPhase) {
        if testrun.phase == previous_phase {
            return;
        }
        log_testrun_operation(
            "phase_changed",
            &testrun.id,
            testrun.execution_group.as_deref(),
            testrun.phase.as_str(),
            Some(previous_phase.as_str()),
        );
        self.publisher.publish_testrun_event(
            events::TESTRUN_PHASE_CHANGED,
            &testrun.id,
            json!({ "from": previous_phase, "to": testrun.phase, "testsRun": testrun.tests_run() }),
        );
    }
}

fn refresh_phase(testrun: &mut Testrun, now: DateTime<Utc>) {
    testrun.phase = aggregate_phase(&testrun.steps);
    if testrun.phase.is_terminal() && testrun.completion_time.is_none() {
        testrun.completion_time = Some(now);
    }
}

/// Remove a trigger annotation; any value but `"false"` counts as set
fn take_trigger(annotations: &mut BTreeMap<String, String>, key: &str) -> bool {
    annotations
        .remove(key)
        .is_some_and(|value| !value.trim().eq_ignore_ascii_case("false"))
}

/// Terminal steps of a testrun, used when re-collecting a settled run
pub fn terminal_steps(testrun: &Testrun) -> impl Iterator<Item = &Step> {
    testrun.steps.iter().filter(|step| step.phase.is_terminal())
}
