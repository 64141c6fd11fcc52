//! # Retry Coordinator
//!
//! Spawns at most one successor per failed testrun until the lineage spends
//! its retry budget. A lineage is the chain of testruns linked through
//! `previous_attempt`; the root has `retries == 0` and every successor
//! increments it by one.
//!
//! Exactly-once spawning rests on the testrun store: a second successor of the
//! same predecessor is rejected on create, so concurrent triggers converge on
//! the successor that won.

use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::tracker::RunStateTracker;
use crate::config::{RetryConfig, RetryMode};
use crate::constants::{events, AnnotationKeys};
use crate::error::{Result, TestMachineryError};
use crate::events::EventPublisher;
use crate::flow::{EngineWorkflow, FlowSpec, TestDefinitionCatalog, WorkflowGraphBuilder};
use crate::metadata::{ConditionKind, Dimension, Testrun};
use crate::state_machine::TestrunPhase;
use crate::store::{StoreError, TestrunStore};

/// What the coordinator did for a testrun
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// A new successor was created and needs to be handed to the engine
    Spawned {
        successor: Testrun,
        workflow: EngineWorkflow,
    },
    /// The testrun already has a successor; nothing new was created
    AlreadySpawned { successor: Testrun },
    RetryBudgetExhausted { retries: u32, max_retries: u32 },
    /// Only failed testruns are retried
    NotFailed { phase: TestrunPhase },
}

impl RetryDecision {
    pub fn successor(&self) -> Option<&Testrun> {
        match self {
            Self::Spawned { successor, .. } | Self::AlreadySpawned { successor } => Some(successor),
            _ => None,
        }
    }
}

/// Changes applied to a successor on top of its predecessor's settings
#[derive(Debug, Clone, Default)]
pub struct RetryOverrides {
    pub dimension: Option<Dimension>,
    pub configuration: BTreeMap<String, String>,
    pub mode: Option<RetryMode>,
}

pub struct RetryCoordinator {
    tracker: Arc<RunStateTracker>,
    store: Arc<dyn TestrunStore>,
    catalog: Arc<dyn TestDefinitionCatalog>,
    publisher: EventPublisher,
    config: RetryConfig,
    keys: &'static AnnotationKeys,
}

impl RetryCoordinator {
    pub fn new(
        tracker: Arc<RunStateTracker>,
        store: Arc<dyn TestrunStore>,
        catalog: Arc<dyn TestDefinitionCatalog>,
        publisher: EventPublisher,
        config: RetryConfig,
    ) -> Self {
        Self {
            tracker,
            store,
            catalog,
            publisher,
            config,
            keys: AnnotationKeys::standard(),
        }
    }

    /// React to a testrun that settled as `Failed`
    pub async fn on_testrun_failed(&self, failed: &Testrun) -> Result<RetryDecision> {
        self.retry(failed, RetryOverrides::default()).await
    }

    /// Spawn the successor of a failed testrun, at most once
    pub async fn retry(&self, failed: &Testrun, overrides: RetryOverrides) -> Result<RetryDecision> {
        if failed.phase != TestrunPhase::Failed {
            return Ok(RetryDecision::NotFailed {
                phase: failed.phase,
            });
        }

        if let Some(existing) = self.store.find_successor(&failed.id).await? {
            debug!(
                testrun_id = %failed.id,
                successor = %existing.value.id,
                "Successor already spawned"
            );
            return Ok(RetryDecision::AlreadySpawned {
                successor: existing.value,
            });
        }

        if failed.retries >= self.config.max_retries {
            return self.exhausted(failed).await;
        }

        let mut successor = self.successor_of(failed, &overrides);
        self.validate_lineage(&successor).await?;

        let graph = WorkflowGraphBuilder::new(self.catalog.as_ref()).build_for(&successor)?;
        successor.steps = graph.to_steps();
        let workflow = graph.to_engine_workflow(&successor.id);

        match self.tracker.register(successor).await {
            Ok(successor) => {
                info!(
                    testrun_id = %failed.id,
                    successor = %successor.id,
                    retries = successor.retries,
                    max_retries = self.config.max_retries,
                    "Spawned retry testrun"
                );
                self.publisher.publish_testrun_event(
                    events::TESTRUN_RETRY_SPAWNED,
                    &failed.id,
                    json!({ "successor": successor.id, "retries": successor.retries }),
                );
                Ok(RetryDecision::Spawned {
                    successor,
                    workflow,
                })
            }
            Err(TestMachineryError::Store(StoreError::SuccessorExists { successor, .. })) => {
                debug!(
                    testrun_id = %failed.id,
                    successor = %successor,
                    "Lost successor race"
                );
                let existing = self.store.get(&successor).await?;
                Ok(RetryDecision::AlreadySpawned {
                    successor: existing.value,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Successor record derived from a failed testrun; steps are not built yet
    pub fn successor_of(&self, failed: &Testrun, overrides: &RetryOverrides) -> Testrun {
        let flow = match overrides.mode.unwrap_or(self.config.mode) {
            RetryMode::Full => failed.flow.clone(),
            RetryMode::Partial => partial_flow(failed),
        };

        let mut successor = Testrun::with_generate_name(&failed.generate_name, flow);
        successor.execution_group = failed.execution_group.clone();
        successor.retries = failed.retries + 1;
        successor.previous_attempt = Some(failed.id.clone());
        successor.dimension = overrides
            .dimension
            .clone()
            .unwrap_or_else(|| failed.dimension.clone());
        successor.configuration = failed.configuration.clone();
        successor
            .configuration
            .extend(overrides.configuration.clone());
        successor.labels = failed.labels.clone();
        successor.component_descriptor = failed.component_descriptor.clone();

        successor.annotations = failed.annotations.clone();
        successor.annotations.remove(self.keys.resume_testrun);
        successor.annotations.remove(self.keys.collect_testrun);
        successor
            .annotations
            .insert(self.keys.retries.to_string(), successor.retries.to_string());
        successor
            .annotations
            .insert(self.keys.previous_attempt.to_string(), failed.id.clone());

        successor
    }

    /// Check that a testrun continues the lineage of its previous attempt
    pub async fn validate_lineage(&self, testrun: &Testrun) -> Result<()> {
        let Some(previous) = &testrun.previous_attempt else {
            return Ok(());
        };
        if *previous == testrun.id {
            return Err(TestMachineryError::Lineage(format!(
                "testrun {} names itself as previous attempt",
                testrun.id
            )));
        }

        let predecessor = match self.store.get(previous).await {
            Ok(record) => record.value,
            Err(StoreError::NotFound { .. }) => {
                return Err(TestMachineryError::Lineage(format!(
                    "previous attempt {previous} of testrun {} does not exist",
                    testrun.id
                )))
            }
            Err(error) => return Err(error.into()),
        };

        if testrun.retries != predecessor.retries + 1 {
            return Err(TestMachineryError::Lineage(format!(
                "testrun {} has retries {} but previous attempt {previous} has {}",
                testrun.id, testrun.retries, predecessor.retries
            )));
        }
        Ok(())
    }

    async fn exhausted(&self, failed: &Testrun) -> Result<RetryDecision> {
        let max_retries = self.config.max_retries;
        if !failed.has_condition(ConditionKind::RetryBudgetExhausted) {
            info!(
                testrun_id = %failed.id,
                retries = failed.retries,
                max_retries = max_retries,
                "Retry budget exhausted"
            );
            self.tracker
                .record_condition(
                    &failed.id,
                    ConditionKind::RetryBudgetExhausted,
                    format!("retry budget of {max_retries} spent after {} retries", failed.retries),
                )
                .await?;
            self.publisher.publish_testrun_event(
                events::TESTRUN_RETRY_EXHAUSTED,
                &failed.id,
                json!({ "retries": failed.retries, "maxRetries": max_retries }),
            );
        }
        Ok(RetryDecision::RetryBudgetExhausted {
            retries: failed.retries,
            max_retries,
        })
    }
}

/// System steps plus the test steps that failed or timed out
///
/// Falls back to the whole flow when no test step failed.
fn partial_flow(failed: &Testrun) -> FlowSpec {
    let rerun: HashSet<&str> = failed
        .steps
        .iter()
        .filter(|step| step.system_step || step.phase.is_failure())
        .map(|step| step.name.as_str())
        .collect();

    let failed_tests = failed
        .steps
        .iter()
        .any(|step| !step.system_step && step.phase.is_failure());
    if !failed_tests {
        return failed.flow.clone();
    }

    failed
        .flow
        .retain_steps(|step| step.system_step || rerun.contains(step.name.as_str()))
}
