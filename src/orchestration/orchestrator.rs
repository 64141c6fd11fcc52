//! # Orchestrator
//!
//! Entry point wiring the graph builder, run state tracker, retry coordinator
//! and result collector together.
//!
//! Phase transitions are applied inline; summary persistence is handed to a
//! background collector worker over a bounded channel so slow persistence
//! never blocks the event path.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::result_collector::{CollectOutcome, ResultCollector};
use super::retry_coordinator::{RetryCoordinator, RetryDecision, RetryOverrides};
use super::tracker::{AnnotationSync, EventDisposition, EventReport, RunStateTracker, SignalReport};
use crate::config::OrchestratorConfig;
use crate::error::{Result, TestMachineryError};
use crate::events::{EventPublisher, PublishedEvent};
use crate::flow::{EngineWorkflow, TestDefinitionCatalog, WorkflowGraphBuilder};
use crate::logging::{log_error, log_testrun_operation};
use crate::metadata::{ConditionKind, Testrun, TestrunSummary};
use crate::state_machine::{RunSignal, StepPhaseEvent, TestrunPhase};
use crate::store::{
    DashboardQuery, MemorySummaryStore, MemoryTestrunStore, SummaryStore, TelemetrySource,
    TestrunStore,
};

/// External systems the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub testruns: Arc<dyn TestrunStore>,
    pub summaries: Arc<dyn SummaryStore>,
    pub telemetry: Option<Arc<dyn TelemetrySource>>,
    pub catalog: Arc<dyn TestDefinitionCatalog>,
}

impl Collaborators {
    /// In-process stores without telemetry
    pub fn in_memory(catalog: Arc<dyn TestDefinitionCatalog>) -> Self {
        Self {
            testruns: Arc::new(MemoryTestrunStore::new()),
            summaries: Arc::new(MemorySummaryStore::new()),
            telemetry: None,
            catalog,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// A registered testrun with the workflow to hand to the engine
#[derive(Debug, Clone)]
pub struct Submission {
    pub testrun: Testrun,
    pub workflow: EngineWorkflow,
}

/// Result of handling one engine event
#[derive(Debug, Clone)]
pub struct EventHandled {
    pub report: EventReport,
    /// Set when the event settled the testrun as `Failed`
    pub retry: Option<RetryDecision>,
}

#[derive(Debug)]
enum CollectRequest {
    Step { testrun: Testrun, step: String },
    Testrun(Testrun),
    All(Testrun),
    Flush(oneshot::Sender<()>),
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    catalog: Arc<dyn TestDefinitionCatalog>,
    summaries: Arc<dyn SummaryStore>,
    tracker: Arc<RunStateTracker>,
    coordinator: RetryCoordinator,
    collector: Arc<ResultCollector>,
    publisher: EventPublisher,
    sender: Mutex<Option<mpsc::Sender<CollectRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Validate the configuration and start the collector worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let publisher = EventPublisher::new(config.events.channel_capacity);
        let tracker = Arc::new(RunStateTracker::new(
            collaborators.testruns.clone(),
            publisher.clone(),
            config.tracker.clone(),
        ));
        let coordinator = RetryCoordinator::new(
            tracker.clone(),
            collaborators.testruns.clone(),
            collaborators.catalog.clone(),
            publisher.clone(),
            config.retry.clone(),
        );
        let telemetry = if config.telemetry.enabled {
            collaborators.telemetry.clone()
        } else {
            None
        };
        let collector = Arc::new(ResultCollector::new(
            collaborators.summaries.clone(),
            telemetry,
            tracker.clone(),
            publisher.clone(),
            BackoffPolicy::from_config(&config.persistence),
            config.telemetry.clone(),
            config.dashboard.cluster_domain.clone(),
        ));

        let (sender, receiver) = mpsc::channel(config.persistence.queue_capacity);
        let worker = tokio::spawn(run_collector(collector.clone(), tracker.clone(), receiver));

        info!(
            max_retries = config.retry.max_retries,
            retry_mode = ?config.retry.mode,
            telemetry = config.telemetry.enabled,
            queue_capacity = config.persistence.queue_capacity,
            "Orchestrator started"
        );

        Ok(Self {
            config,
            catalog: collaborators.catalog,
            summaries: collaborators.summaries,
            tracker,
            coordinator,
            collector,
            publisher,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.publisher.subscribe()
    }

    /// Build the execution graph of a testrun and register it
    ///
    /// An invalid flow aborts the submission before anything is stored.
    pub async fn submit(&self, mut testrun: Testrun) -> Result<Submission> {
        let graph = match WorkflowGraphBuilder::new(self.catalog.as_ref()).build_for(&testrun) {
            Ok(graph) => graph,
            Err(error) => {
                log_error("orchestrator", "submit", &error.to_string(), Some(&testrun.id));
                return Err(error.into());
            }
        };
        self.coordinator.validate_lineage(&testrun).await?;

        testrun.steps = graph.to_steps();
        testrun.phase = TestrunPhase::Pending;
        testrun.start_time = None;
        testrun.completion_time = None;

        let testrun = self.tracker.register(testrun).await?;
        let workflow = graph.to_engine_workflow(&testrun.id);
        Ok(Submission { testrun, workflow })
    }

    /// Apply an engine event, queue summaries and retry failed runs
    pub async fn handle_event(&self, event: StepPhaseEvent) -> Result<EventHandled> {
        let report = self.tracker.apply_event(&event).await?;
        let testrun = &report.testrun;

        let step_terminal = testrun
            .step(&event.step_name)
            .is_some_and(|step| step.phase.is_terminal());
        let collect_step = match &report.disposition {
            EventDisposition::Applied { to, .. } => to.is_terminal(),
            EventDisposition::Duplicate => step_terminal,
            EventDisposition::Rejected(_) => false,
        };

        if collect_step {
            self.enqueue(CollectRequest::Step {
                testrun: testrun.clone(),
                step: event.step_name.clone(),
            })
            .await?;
        }
        for step in &report.skipped {
            self.enqueue(CollectRequest::Step {
                testrun: testrun.clone(),
                step: step.clone(),
            })
            .await?;
        }

        let redelivered_final =
            matches!(report.disposition, EventDisposition::Duplicate) && testrun.phase.is_terminal();
        if report.became_terminal() || redelivered_final {
            self.enqueue(CollectRequest::Testrun(testrun.clone())).await?;
        }

        // redelivery re-triggers the coordinator; an existing successor is reused
        let settled_failed = (report.became_terminal() || redelivered_final)
            && testrun.phase == TestrunPhase::Failed;
        let retry = if settled_failed {
            self.retry_failed(testrun).await
        } else {
            None
        };

        Ok(EventHandled { report, retry })
    }

    /// Pause, resume or cancel a testrun
    pub async fn signal(&self, id: &str, signal: RunSignal) -> Result<SignalReport> {
        let report = self.tracker.signal(id, signal).await?;
        if report.became_terminal() {
            self.enqueue(CollectRequest::All(report.testrun.clone())).await?;
        } else {
            for step in &report.skipped {
                self.enqueue(CollectRequest::Step {
                    testrun: report.testrun.clone(),
                    step: step.clone(),
                })
                .await?;
            }
        }
        Ok(report)
    }

    /// Sync annotations from the live record, acting on resume and collect triggers
    pub async fn sync_annotations(
        &self,
        id: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<AnnotationSync> {
        let sync = self.tracker.sync_annotations(id, annotations).await?;
        if sync.collect_requested {
            if sync.testrun.phase.is_terminal() {
                self.enqueue(CollectRequest::All(sync.testrun.clone())).await?;
            } else {
                debug!(
                    testrun_id = %id,
                    phase = %sync.testrun.phase,
                    "Collect requested before the testrun settled"
                );
            }
        }
        Ok(sync)
    }

    /// Retry a failed testrun with changed settings
    pub async fn retry(&self, id: &str, overrides: RetryOverrides) -> Result<RetryDecision> {
        let testrun = self.tracker.get(id).await?;
        self.coordinator.retry(&testrun, overrides).await
    }

    pub async fn ready_steps(&self, id: &str) -> Result<Vec<String>> {
        self.tracker.ready_steps(id).await
    }

    pub async fn testrun(&self, id: &str) -> Result<Testrun> {
        self.tracker.get(id).await
    }

    /// Testrun summaries of an execution group for the dashboard
    pub async fn list_summaries(&self, query: &DashboardQuery) -> Result<Vec<TestrunSummary>> {
        Ok(self
            .summaries
            .list_by_execution_group(&query.execution_group, query.page)
            .await?)
    }

    /// Parse dashboard query parameters and list the requested page
    pub async fn dashboard_page<'a, I>(&self, params: I) -> Result<Vec<TestrunSummary>>
    where
        I: IntoIterator<Item = (&'a str, &'a str)> + Clone,
    {
        let query = DashboardQuery::parse(params, self.config.dashboard.page_size)?;
        self.list_summaries(&query).await
    }

    /// Wait until every collection queued so far has been processed
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.enqueue(CollectRequest::Flush(done)).await?;
        wait.await.map_err(|_| TestMachineryError::Shutdown)
    }

    /// Stop accepting work and drain the collector queue
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                log_error("orchestrator", "shutdown", &error.to_string(), None);
            }
        }
        info!("Orchestrator stopped");
    }

    /// Run the coordinator for a failed testrun; errors become a condition
    async fn retry_failed(&self, failed: &Testrun) -> Option<RetryDecision> {
        match self.coordinator.on_testrun_failed(failed).await {
            Ok(decision) => Some(decision),
            Err(error) => {
                warn!(testrun_id = %failed.id, error = %error, "Retry of failed testrun not possible");
                if let Err(record_error) = self
                    .tracker
                    .record_condition(&failed.id, ConditionKind::RetryFailed, error.to_string())
                    .await
                {
                    log_error(
                        "orchestrator",
                        "record_condition",
                        &record_error.to_string(),
                        Some(&failed.id),
                    );
                }
                None
            }
        }
    }

    async fn enqueue(&self, request: CollectRequest) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(TestMachineryError::Shutdown)?;
        sender
            .send(request)
            .await
            .map_err(|_| TestMachineryError::Shutdown)
    }
}

async fn run_collector(
    collector: Arc<ResultCollector>,
    tracker: Arc<RunStateTracker>,
    mut receiver: mpsc::Receiver<CollectRequest>,
) {
    while let Some(request) = receiver.recv().await {
        match request {
            CollectRequest::Step { testrun, step } => {
                report_outcome(&collector.collect_step(&testrun, &step).await);
            }
            CollectRequest::Testrun(testrun) => {
                let outcome = collector.collect_testrun(&testrun).await;
                report_outcome(&outcome);
                if outcome.is_persisted() {
                    tracker.evict(&testrun.id);
                    log_testrun_operation(
                        "collected",
                        &testrun.id,
                        testrun.execution_group.as_deref(),
                        testrun.phase.as_str(),
                        None,
                    );
                }
            }
            CollectRequest::All(testrun) => {
                for outcome in collector.collect_all(&testrun).await {
                    report_outcome(&outcome);
                }
            }
            CollectRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Collector worker stopped");
}

fn report_outcome(outcome: &CollectOutcome) {
    match outcome {
        CollectOutcome::Persisted { key, attempts } => {
            debug!(key = %key, attempts = attempts, "Summary persisted");
        }
        CollectOutcome::Duplicate { key } | CollectOutcome::NotTerminal { key } => {
            debug!(key = %key, "Nothing to collect");
        }
        CollectOutcome::Degraded { key, error } => {
            warn!(key = %key, error = %error, "Summary persistence degraded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowSpec, FlowStep, InMemoryCatalog, InvalidFlowError, StepGroup, TestDefinition};
    use crate::state_machine::StepPhase;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn catalog() -> Arc<dyn TestDefinitionCatalog> {
        Arc::new(InMemoryCatalog::new().with(TestDefinition::new("e2e", "tm-e2e")))
    }

    fn flow() -> FlowSpec {
        FlowSpec::new(vec![StepGroup::new("tests", vec![FlowStep::new("a", "e2e")])])
    }

    #[tokio::test]
    async fn test_submit_registers_pending_testrun() {
        let orchestrator =
            Orchestrator::start(OrchestratorConfig::default(), Collaborators::in_memory(catalog()))
                .unwrap();

        let submission = orchestrator.submit(Testrun::new(flow())).await.unwrap();
        assert_eq!(submission.testrun.phase, TestrunPhase::Pending);
        assert_eq!(submission.workflow.name, submission.testrun.id);
        assert_eq!(
            orchestrator.ready_steps(&submission.testrun.id).await.unwrap(),
            vec!["a"]
        );
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_flow_is_not_stored() {
        let collaborators = Collaborators::in_memory(catalog());
        let testruns = collaborators.testruns.clone();
        let orchestrator =
            Orchestrator::start(OrchestratorConfig::default(), collaborators).unwrap();

        let bad = Testrun::new(FlowSpec::new(vec![StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "missing")],
        )]))
        .with_id("tm-bad");
        let err = orchestrator.submit(bad).await.unwrap_err();
        assert!(matches!(
            err,
            TestMachineryError::InvalidFlow(InvalidFlowError::UnknownTestDefinition { .. })
        ));
        assert!(testruns.get("tm-bad").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let orchestrator =
            Orchestrator::start(OrchestratorConfig::default(), Collaborators::in_memory(catalog()))
                .unwrap();
        let submission = orchestrator.submit(Testrun::new(flow())).await.unwrap();
        orchestrator.shutdown().await;

        let id = submission.testrun.id;
        orchestrator
            .handle_event(StepPhaseEvent::new(&id, "a", StepPhase::Running))
            .await
            .unwrap();
        let err = orchestrator
            .handle_event(StepPhaseEvent::new(&id, "a", StepPhase::Succeeded))
            .await
            .unwrap_err();
        assert_eq!(err, TestMachineryError::Shutdown);
    }

    /// Catalog whose definitions can be withdrawn and restored
    struct SwitchableCatalog {
        inner: InMemoryCatalog,
        available: AtomicBool,
    }

    impl TestDefinitionCatalog for SwitchableCatalog {
        fn get(&self, name: &str) -> Option<TestDefinition> {
            if self.available.load(Ordering::SeqCst) {
                self.inner.get(name)
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn test_failed_retry_is_recorded_and_redelivery_retries() {
        let switchable = Arc::new(SwitchableCatalog {
            inner: InMemoryCatalog::new().with(TestDefinition::new("e2e", "tm-e2e")),
            available: AtomicBool::new(true),
        });
        let collaborators = Collaborators::in_memory(switchable.clone());
        let testruns = collaborators.testruns.clone();
        let mut config = OrchestratorConfig::default();
        config.retry.max_retries = 1;
        let orchestrator = Orchestrator::start(config, collaborators).unwrap();

        let id = orchestrator.submit(Testrun::new(flow())).await.unwrap().testrun.id;
        orchestrator
            .handle_event(StepPhaseEvent::new(&id, "a", StepPhase::Running))
            .await
            .unwrap();

        switchable.available.store(false, Ordering::SeqCst);
        let failed = orchestrator
            .handle_event(StepPhaseEvent::new(&id, "a", StepPhase::Failed))
            .await
            .unwrap();
        assert_eq!(failed.report.testrun.phase, TestrunPhase::Failed);
        assert!(failed.retry.is_none());
        let stored = orchestrator.testrun(&id).await.unwrap();
        assert!(stored.has_condition(ConditionKind::RetryFailed));
        assert!(testruns.find_successor(&id).await.unwrap().is_none());

        switchable.available.store(true, Ordering::SeqCst);
        let redelivered = orchestrator
            .handle_event(StepPhaseEvent::new(&id, "a", StepPhase::Failed))
            .await
            .unwrap();
        assert_eq!(redelivered.report.disposition, EventDisposition::Duplicate);
        let Some(RetryDecision::Spawned { successor, .. }) = &redelivered.retry else {
            panic!("expected a successor, got {:?}", redelivered.retry);
        };
        assert_eq!(successor.previous_attempt.as_deref(), Some(id.as_str()));

        let again = orchestrator
            .handle_event(StepPhaseEvent::new(&id, "a", StepPhase::Failed))
            .await
            .unwrap();
        assert!(matches!(again.retry, Some(RetryDecision::AlreadySpawned { .. })));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.events.channel_capacity = 0;
        assert!(matches!(
            Orchestrator::start(config, Collaborators::in_memory(catalog())),
            Err(TestMachineryError::Configuration(_))
        ));
    }
}
