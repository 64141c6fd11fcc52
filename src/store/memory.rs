use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::errors::{PersistenceResult, StoreError, StoreResult, TelemetryError};
use super::pagination::Page;
use super::{SummaryStore, TelemetrySource, TestrunStore, TimeWindow, Versioned};
use crate::metadata::{Metadata, StepSummary, TelemetryData, Testrun, TestrunSummary};

/// Testrun store held in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryTestrunStore {
    records: Arc<RwLock<HashMap<String, Versioned<Testrun>>>>,
}

impl MemoryTestrunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Bump the version of a record as a concurrent writer would
    pub fn touch(&self, id: &str) -> StoreResult<u64> {
        let mut records = self.records.write();
        let record = records.get_mut(id).ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;
        record.version += 1;
        Ok(record.version)
    }

    /// Let an operator edit annotations outside of the core
    pub fn edit_annotation(&self, id: &str, key: &str, value: &str) -> StoreResult<u64> {
        let mut records = self.records.write();
        let record = records.get_mut(id).ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;
        record
            .value
            .annotations
            .insert(key.to_string(), value.to_string());
        record.version += 1;
        Ok(record.version)
    }
}

#[async_trait]
impl TestrunStore for MemoryTestrunStore {
    async fn create(&self, testrun: Testrun) -> StoreResult<Versioned<Testrun>> {
        let mut records = self.records.write();
        if records.contains_key(&testrun.id) {
            return Err(StoreError::AlreadyExists { id: testrun.id });
        }
        if let Some(predecessor) = &testrun.previous_attempt {
            if let Some(existing) = records
                .values()
                .find(|record| record.value.previous_attempt.as_deref() == Some(predecessor))
            {
                return Err(StoreError::SuccessorExists {
                    predecessor: predecessor.clone(),
                    successor: existing.value.id.clone(),
                });
            }
        }

        let record = Versioned {
            value: testrun,
            version: 1,
        };
        records.insert(record.value.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> StoreResult<Versioned<Testrun>> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn update(
        &self,
        testrun: Testrun,
        expected_version: u64,
    ) -> StoreResult<Versioned<Testrun>> {
        let mut records = self.records.write();
        let current = records
            .get_mut(&testrun.id)
            .ok_or_else(|| StoreError::NotFound {
                id: testrun.id.clone(),
            })?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id: testrun.id,
                expected: expected_version,
                actual: current.version,
            });
        }

        current.value = testrun;
        current.version += 1;
        Ok(current.clone())
    }

    async fn find_successor(&self, id: &str) -> StoreResult<Option<Versioned<Testrun>>> {
        Ok(self
            .records
            .read()
            .values()
            .find(|record| record.value.previous_attempt.as_deref() == Some(id))
            .cloned())
    }
}

#[derive(Debug, Default)]
struct SummaryState {
    metadata: HashMap<String, Metadata>,
    steps: HashMap<String, StepSummary>,
    testruns: HashMap<String, TestrunSummary>,
    writes: u64,
}

/// Summary store held in process memory
#[derive(Debug, Clone, Default)]
pub struct MemorySummaryStore {
    state: Arc<Mutex<SummaryState>>,
}

impl MemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_summary_count(&self) -> usize {
        self.state.lock().steps.len()
    }

    pub fn testrun_summary_count(&self) -> usize {
        self.state.lock().testruns.len()
    }

    /// Number of upserts received, including overwrites
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }
}

#[async_trait]
impl SummaryStore for MemorySummaryStore {
    async fn upsert_metadata(&self, key: &str, metadata: &Metadata) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        state.metadata.insert(key.to_string(), metadata.clone());
        state.writes += 1;
        Ok(())
    }

    async fn upsert_step_summary(
        &self,
        key: &str,
        summary: &StepSummary,
    ) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        state.steps.insert(key.to_string(), summary.clone());
        state.writes += 1;
        Ok(())
    }

    async fn upsert_testrun_summary(
        &self,
        key: &str,
        summary: &TestrunSummary,
    ) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        state.testruns.insert(key.to_string(), summary.clone());
        state.writes += 1;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> PersistenceResult<Option<Metadata>> {
        Ok(self.state.lock().metadata.get(key).cloned())
    }

    async fn get_step_summary(&self, key: &str) -> PersistenceResult<Option<StepSummary>> {
        Ok(self.state.lock().steps.get(key).cloned())
    }

    async fn get_testrun_summary(&self, key: &str) -> PersistenceResult<Option<TestrunSummary>> {
        Ok(self.state.lock().testruns.get(key).cloned())
    }

    async fn list_by_execution_group(
        &self,
        execution_group: &str,
        page: Page,
    ) -> PersistenceResult<Vec<TestrunSummary>> {
        let mut summaries: Vec<TestrunSummary> = self
            .state
            .lock()
            .testruns
            .values()
            .filter(|summary| {
                summary
                    .metadata
                    .as_ref()
                    .is_some_and(|metadata| metadata.testrun.execution_group == execution_group)
            })
            .cloned()
            .collect();
        summaries.sort_by(|a, b| (a.start_time, summary_id(a)).cmp(&(b.start_time, summary_id(b))));
        Ok(page.apply(summaries))
    }
}

fn summary_id(summary: &TestrunSummary) -> &str {
    summary
        .metadata
        .as_ref()
        .map(|metadata| metadata.testrun.id.as_str())
        .unwrap_or_default()
}

/// Telemetry source serving pre-recorded data per testrun
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetrySource {
    data: Arc<RwLock<HashMap<String, TelemetryData>>>,
    unavailable: Arc<RwLock<Option<String>>>,
    requests: Arc<Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>>,
}

impl StaticTelemetrySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, testrun_id: impl Into<String>, data: TelemetryData) {
        self.data.write().insert(testrun_id.into(), data);
    }

    /// Make every fetch fail with the given reason
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        *self.unavailable.write() = Some(reason.into());
    }

    /// Fetches seen so far as `(testrun id, window start, window end)`
    pub fn requests(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetrySource {
    async fn fetch(
        &self,
        testrun_id: &str,
        window: TimeWindow,
    ) -> Result<Option<TelemetryData>, TelemetryError> {
        self.requests
            .lock()
            .push((testrun_id.to_string(), window.start, window.end));
        if let Some(reason) = self.unavailable.read().clone() {
            return Err(TelemetryError::Unavailable(reason));
        }
        Ok(self.data.read().get(testrun_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowSpec, FlowStep, StepGroup};

    fn testrun(id: &str) -> Testrun {
        Testrun::new(FlowSpec::new(vec![StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "def")],
        )]))
        .with_id(id)
    }

    #[tokio::test]
    async fn test_versioned_update_detects_conflicts() {
        let store = MemoryTestrunStore::new();
        let created = store.create(testrun("tm-1")).await.unwrap();
        assert_eq!(created.version, 1);

        let updated = store.update(created.value.clone(), 1).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.update(created.value, 1).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                id: "tm-1".to_string(),
                expected: 1,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_second_successor() {
        let store = MemoryTestrunStore::new();
        store.create(testrun("tm-1")).await.unwrap();
        assert!(matches!(
            store.create(testrun("tm-1")).await,
            Err(StoreError::AlreadyExists { .. })
        ));

        let mut first = testrun("tm-2");
        first.previous_attempt = Some("tm-1".to_string());
        store.create(first).await.unwrap();

        let mut second = testrun("tm-3");
        second.previous_attempt = Some("tm-1".to_string());
        assert!(matches!(
            store.create(second).await,
            Err(StoreError::SuccessorExists { .. })
        ));

        let successor = store.find_successor("tm-1").await.unwrap().unwrap();
        assert_eq!(successor.value.id, "tm-2");
        assert!(store.find_successor("tm-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_operator_edit_bumps_version() {
        let store = MemoryTestrunStore::new();
        store.create(testrun("tm-1")).await.unwrap();
        assert_eq!(store.edit_annotation("tm-1", "k", "v").unwrap(), 2);
        let record = store.get("tm-1").await.unwrap();
        assert_eq!(record.value.annotations["k"], "v");
    }

    #[tokio::test]
    async fn test_telemetry_source_records_requests() {
        let source = StaticTelemetrySource::new();
        let now = Utc::now();
        let window = TimeWindow {
            start: now,
            end: now,
        };
        assert!(source.fetch("tm-1", window).await.unwrap().is_none());

        source.set_unavailable("agent down");
        assert!(source.fetch("tm-1", window).await.is_err());
        assert_eq!(source.requests().len(), 2);
    }
}
