use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use testmachinery::config::{OrchestratorConfig, PersistenceConfig, RetryMode};
use testmachinery::flow::{
    FlowSpec, FlowStep, InMemoryCatalog, StepGroup, TestDefinition, TestDefinitionCatalog,
};
use testmachinery::metadata::{Dimension, Metadata, StepSummary, Testrun, TestrunSummary};
use testmachinery::orchestration::{Collaborators, EventHandled, Orchestrator};
use testmachinery::state_machine::{StepPhase, StepPhaseEvent};
use testmachinery::store::{
    MemorySummaryStore, MemoryTestrunStore, Page, PersistenceError, PersistenceResult,
    SummaryStore,
};

pub fn catalog() -> Arc<dyn TestDefinitionCatalog> {
    Arc::new(
        InMemoryCatalog::new()
            .with(TestDefinition::new("create-shoot", "tm-base").system())
            .with(TestDefinition::new("delete-shoot", "tm-base").system())
            .with(
                TestDefinition::new("conformance", "tm-conformance")
                    .with_args(["--provider=${cloudprovider}"])
                    .with_label("default"),
            )
            .with(TestDefinition::new("e2e", "tm-e2e").with_label("default")),
    )
}

/// Steps `a` and `b` in parallel, then `c`
pub fn join_flow() -> FlowSpec {
    FlowSpec::new(vec![
        StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "conformance"), FlowStep::new("b", "e2e")],
        ),
        StepGroup::new("post", vec![FlowStep::new("c", "e2e")]),
    ])
}

/// Test steps `a` and `b` wrapped in cluster create and delete system steps
pub fn shoot_flow() -> FlowSpec {
    FlowSpec::new(vec![
        StepGroup::new("setup", vec![FlowStep::new("create", "create-shoot")]),
        StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "e2e"), FlowStep::new("b", "e2e")],
        ),
        StepGroup::new("teardown", vec![FlowStep::new("delete", "delete-shoot")]),
    ])
}

pub fn single_step_flow() -> FlowSpec {
    FlowSpec::new(vec![StepGroup::new(
        "tests",
        vec![FlowStep::new("a", "conformance")],
    )])
}

/// Testrun in execution group `eg-1` on a gcp 1.16.3 dimension
pub fn testrun(flow: FlowSpec) -> Testrun {
    Testrun::new(flow)
        .with_execution_group("eg-1")
        .with_dimension(Dimension::new("gcp", "1.16.3"))
}

pub fn test_config(max_retries: u32) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.max_retries = max_retries;
    config.retry.mode = RetryMode::Full;
    config.persistence = PersistenceConfig {
        attempt_timeout_ms: 500,
        base_delay_ms: 1,
        backoff_multiplier: 2.0,
        max_delay_ms: 4,
        max_attempts: 3,
        queue_capacity: 64,
    };
    config.dashboard.cluster_domain = "ingress.tm.example.com".to_string();
    config.dashboard.page_size = 2;
    config
}

pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub testruns: Arc<MemoryTestrunStore>,
    pub summaries: Arc<FlakySummaryStore>,
}

impl Fixture {
    pub fn start(config: OrchestratorConfig) -> Self {
        let testruns = Arc::new(MemoryTestrunStore::new());
        let summaries = Arc::new(FlakySummaryStore::default());
        let collaborators = Collaborators {
            testruns: testruns.clone(),
            summaries: summaries.clone(),
            telemetry: None,
            catalog: catalog(),
        };
        let orchestrator = Orchestrator::start(config, collaborators).unwrap();
        Self {
            orchestrator,
            testruns,
            summaries,
        }
    }

    pub async fn event(&self, testrun_id: &str, step: &str, phase: StepPhase) -> EventHandled {
        self.orchestrator
            .handle_event(StepPhaseEvent::new(testrun_id, step, phase))
            .await
            .unwrap()
    }

    /// Run a step from `Pending` to the given terminal phase
    pub async fn finish(&self, testrun_id: &str, step: &str, phase: StepPhase) -> EventHandled {
        self.event(testrun_id, step, StepPhase::Running).await;
        self.event(testrun_id, step, phase).await
    }
}

/// Summary store that can be switched into failing with transient errors
#[derive(Default)]
pub struct FlakySummaryStore {
    pub inner: MemorySummaryStore,
    failures_left: AtomicU32,
    down: AtomicBool,
    rejected: AtomicU32,
}

impl FlakySummaryStore {
    /// Fail the next `count` writes
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn rejected_writes(&self) -> u32 {
        self.rejected.load(Ordering::SeqCst)
    }

    fn check(&self) -> PersistenceResult<()> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected || self.down.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(PersistenceError::Transient("summary store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SummaryStore for FlakySummaryStore {
    async fn upsert_metadata(&self, key: &str, metadata: &Metadata) -> PersistenceResult<()> {
        self.check()?;
        self.inner.upsert_metadata(key, metadata).await
    }

    async fn upsert_step_summary(
        &self,
        key: &str,
        summary: &StepSummary,
    ) -> PersistenceResult<()> {
        self.check()?;
        self.inner.upsert_step_summary(key, summary).await
    }

    async fn upsert_testrun_summary(
        &self,
        key: &str,
        summary: &TestrunSummary,
    ) -> PersistenceResult<()> {
        self.check()?;
        self.inner.upsert_testrun_summary(key, summary).await
    }

    async fn get_metadata(&self, key: &str) -> PersistenceResult<Option<Metadata>> {
        self.inner.get_metadata(key).await
    }

    async fn get_step_summary(&self, key: &str) -> PersistenceResult<Option<StepSummary>> {
        self.inner.get_step_summary(key).await
    }

    async fn get_testrun_summary(&self, key: &str) -> PersistenceResult<Option<TestrunSummary>> {
        self.inner.get_testrun_summary(key).await
    }

    async fn list_by_execution_group(
        &self,
        execution_group: &str,
        page: Page,
    ) -> PersistenceResult<Vec<TestrunSummary>> {
        self.inner.list_by_execution_group(execution_group, page).await
    }
}
