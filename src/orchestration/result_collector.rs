//! # Result Collector
//!
//! Turns terminal steps and settled testruns into summaries and persists them.
//!
//! Delivery is at least once, so every unit of work claims a composite key
//! first. A claimed key is only released again when persistence fails, which
//! lets a re-delivery retry while a successful collection stays a no-op.
//! Once the summary of a testrun is persisted all of its claims are dropped;
//! later re-deliveries find their summary in the store instead.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::backoff::{retry_with_backoff, BackoffPolicy};
use super::tracker::{terminal_steps, RunStateTracker};
use crate::config::TelemetryConfig;
use crate::constants::events;
use crate::events::EventPublisher;
use crate::logging::{log_error, log_persistence_operation};
use crate::metadata::{
    precompute, ConditionKind, Step, StepExportMetadata, StepSummary, StepSummaryMetadata,
    SummaryType, TelemetryData, Testrun, TestrunSummary,
};
use crate::store::{PersistenceError, SummaryStore, TelemetrySource, TimeWindow};

/// Result of one collection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum CollectOutcome {
    Persisted { key: String, attempts: u32 },
    /// Key already collected or in flight
    Duplicate { key: String },
    /// Nothing to collect yet
    NotTerminal { key: String },
    /// Persistence gave up; the key is free for a later retry
    Degraded { key: String, error: PersistenceError },
}

impl CollectOutcome {
    pub fn key(&self) -> &str {
        match self {
            Self::Persisted { key, .. }
            | Self::Duplicate { key }
            | Self::NotTerminal { key }
            | Self::Degraded { key, .. } => key,
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }
}

/// Idempotency key of a step summary
pub fn step_summary_key(testrun_id: &str, step: &Step) -> String {
    format!("{testrun_id}/{}/{}", step.name, step.phase)
}

pub struct ResultCollector {
    summaries: Arc<dyn SummaryStore>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    tracker: Arc<RunStateTracker>,
    publisher: EventPublisher,
    policy: BackoffPolicy,
    telemetry_config: TelemetryConfig,
    cluster_domain: String,
    /// Claimed keys per testrun id
    claimed: DashMap<String, HashSet<String>>,
}

impl ResultCollector {
    pub fn new(
        summaries: Arc<dyn SummaryStore>,
        telemetry: Option<Arc<dyn TelemetrySource>>,
        tracker: Arc<RunStateTracker>,
        publisher: EventPublisher,
        policy: BackoffPolicy,
        telemetry_config: TelemetryConfig,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            summaries,
            telemetry,
            tracker,
            publisher,
            policy,
            telemetry_config,
            cluster_domain: cluster_domain.into(),
            claimed: DashMap::new(),
        }
    }

    /// Collect the summary of one step of a testrun
    pub async fn collect_step(&self, testrun: &Testrun, step_name: &str) -> CollectOutcome {
        let Some(step) = testrun.step(step_name) else {
            return CollectOutcome::NotTerminal {
                key: format!("{}/{step_name}", testrun.id),
            };
        };
        let key = step_summary_key(&testrun.id, step);
        if !step.phase.is_terminal() {
            return CollectOutcome::NotTerminal { key };
        }
        if !self.claim(&testrun.id, &key) {
            debug!(key = %key, "Step summary already collected");
            return CollectOutcome::Duplicate { key };
        }
        if self.step_summary_exists(&key).await {
            self.release(&testrun.id, &key);
            debug!(key = %key, "Step summary already in the store");
            return CollectOutcome::Duplicate { key };
        }

        let summary = self.step_summary(testrun, step);
        let started = Instant::now();
        let outcome = retry_with_backoff(&self.policy, "upsert_step_summary", || {
            self.summaries.upsert_step_summary(&key, &summary)
        })
        .await;

        match outcome.result {
            Ok(()) => {
                log_persistence_operation(
                    "upsert_step_summary",
                    &key,
                    "persisted",
                    outcome.attempts,
                    Some(elapsed_ms(started)),
                );
                self.publisher.publish_step_event(
                    events::SUMMARY_PERSISTED,
                    &testrun.id,
                    step_name,
                    json!({ "key": key, "attempts": outcome.attempts }),
                );
                CollectOutcome::Persisted {
                    key,
                    attempts: outcome.attempts,
                }
            }
            Err(error) => self.degrade(testrun, key, error).await,
        }
    }

    /// Collect the metadata record and the summary of a settled testrun
    pub async fn collect_testrun(&self, testrun: &Testrun) -> CollectOutcome {
        let key = format!("{}/{}", testrun.id, testrun.phase);
        if !testrun.phase.is_terminal() {
            return CollectOutcome::NotTerminal { key };
        }
        if !self.claim(&testrun.id, &key) {
            debug!(key = %key, "Testrun summary already collected");
            return CollectOutcome::Duplicate { key };
        }
        if self.testrun_summary_exists(testrun).await {
            self.release(&testrun.id, &key);
            debug!(key = %key, "Testrun summary already in the store");
            return CollectOutcome::Duplicate { key };
        }

        let telemetry = self.fetch_telemetry(testrun).await;
        let mut metadata = testrun.metadata();
        metadata.telemetry_data = telemetry.clone();
        let summary = self.testrun_summary(testrun, telemetry);

        let started = Instant::now();
        let metadata_outcome = retry_with_backoff(&self.policy, "upsert_metadata", || {
            self.summaries.upsert_metadata(&testrun.id, &metadata)
        })
        .await;
        if let Err(error) = metadata_outcome.result {
            return self.degrade(testrun, key, error).await;
        }

        let summary_outcome = retry_with_backoff(&self.policy, "upsert_testrun_summary", || {
            self.summaries.upsert_testrun_summary(&testrun.id, &summary)
        })
        .await;
        let attempts = metadata_outcome.attempts + summary_outcome.attempts;

        match summary_outcome.result {
            Ok(()) => {
                log_persistence_operation(
                    "upsert_testrun_summary",
                    &key,
                    "persisted",
                    attempts,
                    Some(elapsed_ms(started)),
                );
                self.publisher.publish_testrun_event(
                    events::SUMMARY_PERSISTED,
                    &testrun.id,
                    json!({ "key": key, "testsRun": summary.tests_run }),
                );
                self.claimed.remove(&testrun.id);
                CollectOutcome::Persisted { key, attempts }
            }
            Err(error) => self.degrade(testrun, key, error).await,
        }
    }

    /// Collect every terminal step and, once settled, the testrun itself
    pub async fn collect_all(&self, testrun: &Testrun) -> Vec<CollectOutcome> {
        let mut outcomes = join_all(
            terminal_steps(testrun).map(|step| self.collect_step(testrun, &step.name)),
        )
        .await;
        if testrun.phase.is_terminal() {
            outcomes.push(self.collect_testrun(testrun).await);
        }
        outcomes
    }

    pub fn step_summary(&self, testrun: &Testrun, step: &Step) -> StepSummary {
        let metadata = testrun.metadata();
        let pre_computed = precompute(step.phase, &metadata.dimension(), &self.cluster_domain);
        StepSummary {
            metadata: Some(StepSummaryMetadata {
                metadata,
                step_name: step.name.clone(),
                test_def_name: step.test_definition.clone(),
            }),
            summary_type: SummaryType::Teststep,
            name: step.test_definition.clone(),
            step_name: step.name.clone(),
            labels: step.labels.clone(),
            phase: step.phase,
            start_time: step.start_time,
            duration: step.duration.unwrap_or_default(),
            pre_computed: Some(pre_computed),
        }
    }

    /// Metadata exported next to the artifacts of a step
    pub fn export_metadata(&self, testrun: &Testrun, step: &Step) -> StepExportMetadata {
        StepExportMetadata {
            summary_metadata: StepSummaryMetadata {
                metadata: testrun.metadata(),
                step_name: step.name.clone(),
                test_def_name: step.test_definition.clone(),
            },
            phase: Some(step.phase),
            start_time: step.start_time,
            duration: step.duration.unwrap_or_default(),
            pod_name: step.host_ref.clone().unwrap_or_default(),
        }
    }

    pub fn testrun_summary(
        &self,
        testrun: &Testrun,
        telemetry: Option<TelemetryData>,
    ) -> TestrunSummary {
        TestrunSummary {
            metadata: Some(testrun.metadata()),
            summary_type: SummaryType::Testrun,
            phase: testrun.phase,
            start_time: testrun.start_time,
            duration: testrun.duration_seconds(Utc::now()),
            tests_run: testrun.tests_run(),
            telemetry_data: telemetry,
        }
    }

    pub fn claimed_keys(&self) -> usize {
        self.claimed.iter().map(|entry| entry.value().len()).sum()
    }

    fn claim(&self, testrun_id: &str, key: &str) -> bool {
        self.claimed
            .entry(testrun_id.to_string())
            .or_default()
            .insert(key.to_string())
    }

    fn release(&self, testrun_id: &str, key: &str) {
        if let Some(mut keys) = self.claimed.get_mut(testrun_id) {
            keys.remove(key);
        }
        self.claimed.remove_if(testrun_id, |_, keys| keys.is_empty());
    }

    async fn step_summary_exists(&self, key: &str) -> bool {
        match self.summaries.get_step_summary(key).await {
            Ok(existing) => existing.is_some(),
            Err(error) => {
                debug!(key = %key, error = %error, "Could not look up step summary");
                false
            }
        }
    }

    async fn testrun_summary_exists(&self, testrun: &Testrun) -> bool {
        match self.summaries.get_testrun_summary(&testrun.id).await {
            Ok(existing) => existing.is_some_and(|summary| summary.phase == testrun.phase),
            Err(error) => {
                debug!(testrun_id = %testrun.id, error = %error, "Could not look up testrun summary");
                false
            }
        }
    }

    async fn fetch_telemetry(&self, testrun: &Testrun) -> Option<TelemetryData> {
        if !self.telemetry_config.enabled {
            return None;
        }
        let source = self.telemetry.as_ref()?;
        let start = testrun.start_time?;
        let window = TimeWindow {
            start,
            end: testrun.completion_time.unwrap_or_else(Utc::now),
        };

        let timeout = self.telemetry_config.timeout();
        let message = match tokio::time::timeout(timeout, source.fetch(&testrun.id, window)).await {
            Ok(Ok(data)) => return data,
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("telemetry fetch timed out after {}ms", timeout.as_millis()),
        };

        warn!(testrun_id = %testrun.id, error = %message, "Collecting summary without telemetry");
        if let Err(error) = self
            .tracker
            .record_condition(&testrun.id, ConditionKind::TelemetryUnavailable, message)
            .await
        {
            log_error(
                "result_collector",
                "record_condition",
                &error.to_string(),
                Some(&testrun.id),
            );
        }
        None
    }

    async fn degrade(&self, testrun: &Testrun, key: String, error: PersistenceError) -> CollectOutcome {
        self.release(&testrun.id, &key);
        log_persistence_operation("collect", &key, "degraded", self.policy.max_attempts, None);

        if let Err(record_error) = self
            .tracker
            .record_condition(
                &testrun.id,
                ConditionKind::SummaryPersistenceDegraded,
                format!("persisting {key} failed: {error}"),
            )
            .await
        {
            log_error(
                "result_collector",
                "record_condition",
                &record_error.to_string(),
                Some(&key),
            );
        }
        self.publisher.publish_testrun_event(
            events::SUMMARY_DEGRADED,
            &testrun.id,
            json!({ "key": key, "error": error.to_string() }),
        );
        CollectOutcome::Degraded { key, error }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::flow::{FlowSpec, FlowStep, StepGroup};
    use crate::metadata::Dimension;
    use crate::state_machine::{StepPhase, TestrunPhase};
    use crate::store::{MemorySummaryStore, MemoryTestrunStore, StaticTelemetrySource, TestrunStore};
    use std::time::Duration;

    fn testrun() -> Testrun {
        let flow = FlowSpec::new(vec![StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "conformance"), FlowStep::new("b", "create")],
        )]);
        let mut testrun = Testrun::new(flow)
            .with_id("tm-1")
            .with_execution_group("group-1")
            .with_dimension(Dimension::new("gcp", "1.16.3"));
        let mut a = Step::new("a", "conformance");
        a.phase = StepPhase::Succeeded;
        a.duration = Some(42);
        let mut b = Step::new("b", "create");
        b.phase = StepPhase::Succeeded;
        b.system_step = true;
        testrun.steps = vec![a, b];
        testrun.phase = TestrunPhase::Succeeded;
        testrun.start_time = Some(Utc::now() - chrono::Duration::minutes(5));
        testrun.completion_time = Some(Utc::now());
        testrun
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(100),
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(2),
        }
    }

    async fn collector(
        summaries: Arc<dyn SummaryStore>,
        telemetry: Option<Arc<dyn TelemetrySource>>,
    ) -> ResultCollector {
        let store = Arc::new(MemoryTestrunStore::new());
        store.create(testrun()).await.unwrap();
        let tracker = Arc::new(RunStateTracker::new(
            store,
            EventPublisher::default(),
            TrackerConfig::default(),
        ));
        ResultCollector::new(
            summaries,
            telemetry,
            tracker,
            EventPublisher::default(),
            policy(),
            TelemetryConfig::default(),
            "ingress.example.com",
        )
    }

    #[tokio::test]
    async fn test_step_summary_precomputes_dashboard_fields() {
        let summaries = Arc::new(MemorySummaryStore::new());
        let collector = collector(summaries.clone(), None).await;
        let testrun = testrun();

        let outcome = collector.collect_step(&testrun, "a").await;
        assert_eq!(
            outcome,
            CollectOutcome::Persisted {
                key: "tm-1/a/Succeeded".to_string(),
                attempts: 1
            }
        );

        let summary = summaries
            .get_step_summary("tm-1/a/Succeeded")
            .await
            .unwrap()
            .unwrap();
        let pre = summary.pre_computed.unwrap();
        assert_eq!(summary.name, "conformance");
        assert_eq!(summary.step_name, "a");
        assert_eq!(summary.duration, 42);
        assert_eq!(pre.phase_num, Some(100));
        assert_eq!(pre.k8s_major_minor_version, "1.16");
        assert_eq!(pre.cluster_domain, "ingress.example.com");
        assert_eq!(pre.provider_enhanced, "gcp");
    }

    #[tokio::test]
    async fn test_export_metadata_names_pod_and_phase() {
        let collector = collector(Arc::new(MemorySummaryStore::new()), None).await;
        let mut testrun = testrun();
        testrun.steps[0].host_ref = Some("tm-1-a-pod".to_string());

        let export = collector.export_metadata(&testrun, &testrun.steps[0]);
        assert_eq!(export.pod_name, "tm-1-a-pod");
        assert_eq!(export.phase, Some(StepPhase::Succeeded));
        assert_eq!(export.duration, 42);

        let value = serde_json::to_value(&export).unwrap();
        assert_eq!(value["podName"], "tm-1-a-pod");
        assert_eq!(value["stepName"], "a");
        assert_eq!(value["tr"]["executionGroup"], "group-1");
    }

    #[tokio::test]
    async fn test_redelivery_is_a_noop() {
        let summaries = Arc::new(MemorySummaryStore::new());
        let collector = collector(summaries.clone(), None).await;
        let testrun = testrun();

        assert!(collector.collect_step(&testrun, "a").await.is_persisted());
        for _ in 0..3 {
            assert!(matches!(
                collector.collect_step(&testrun, "a").await,
                CollectOutcome::Duplicate { .. }
            ));
        }
        assert_eq!(summaries.step_summary_count(), 1);
        assert_eq!(summaries.write_count(), 1);
    }

    #[tokio::test]
    async fn test_settled_testrun_drops_its_claims() {
        let summaries = Arc::new(MemorySummaryStore::new());
        let collector = collector(summaries.clone(), None).await;
        let testrun = testrun();

        assert!(collector.collect_step(&testrun, "a").await.is_persisted());
        assert_eq!(collector.claimed_keys(), 1);
        assert!(collector.collect_testrun(&testrun).await.is_persisted());
        assert_eq!(collector.claimed_keys(), 0);
        let writes = summaries.write_count();

        assert!(matches!(
            collector.collect_step(&testrun, "a").await,
            CollectOutcome::Duplicate { .. }
        ));
        assert!(matches!(
            collector.collect_testrun(&testrun).await,
            CollectOutcome::Duplicate { .. }
        ));
        assert_eq!(collector.claimed_keys(), 0);
        assert_eq!(summaries.write_count(), writes);
        assert!(collector.collect_step(&testrun, "b").await.is_persisted());
        assert_eq!(summaries.step_summary_count(), 2);
    }

    #[tokio::test]
    async fn test_testrun_summary_counts_tests_and_attaches_telemetry() {
        let summaries = Arc::new(MemorySummaryStore::new());
        let telemetry = Arc::new(StaticTelemetrySource::new());
        telemetry.insert("tm-1", TelemetryData::default());
        let collector = collector(summaries.clone(), Some(telemetry.clone())).await;

        let outcome = collector.collect_testrun(&testrun()).await;
        assert_eq!(outcome.key(), "tm-1/Succeeded");
        assert!(outcome.is_persisted());

        let summary = summaries.get_testrun_summary("tm-1").await.unwrap().unwrap();
        assert_eq!(summary.tests_run, 1);
        assert_eq!(summary.telemetry_data, Some(TelemetryData::default()));
        assert!(summary.duration >= 300);
        assert!(summaries.get_metadata("tm-1").await.unwrap().is_some());
        assert_eq!(telemetry.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_telemetry_failure_is_not_fatal() {
        let summaries = Arc::new(MemorySummaryStore::new());
        let telemetry = Arc::new(StaticTelemetrySource::new());
        telemetry.set_unavailable("connection refused");
        let collector = collector(summaries.clone(), Some(telemetry)).await;

        assert!(collector.collect_testrun(&testrun()).await.is_persisted());
        let summary = summaries.get_testrun_summary("tm-1").await.unwrap().unwrap();
        assert!(summary.telemetry_data.is_none());

        let stored = collector.tracker.get("tm-1").await.unwrap();
        assert!(stored.has_condition(ConditionKind::TelemetryUnavailable));
    }

    #[tokio::test]
    async fn test_running_testrun_is_not_collected() {
        let summaries = Arc::new(MemorySummaryStore::new());
        let collector = collector(summaries.clone(), None).await;
        let mut testrun = testrun();
        testrun.phase = TestrunPhase::Running;

        assert!(matches!(
            collector.collect_testrun(&testrun).await,
            CollectOutcome::NotTerminal { .. }
        ));
        assert_eq!(collector.claimed_keys(), 0);
        assert_eq!(summaries.write_count(), 0);
    }

    #[tokio::test]
    async fn test_collect_all_covers_steps_and_run() {
        let summaries = Arc::new(MemorySummaryStore::new());
        let collector = collector(summaries.clone(), None).await;

        let outcomes = collector.collect_all(&testrun()).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(CollectOutcome::is_persisted));
        assert_eq!(summaries.step_summary_count(), 2);
        assert_eq!(summaries.testrun_summary_count(), 1);
    }
}
