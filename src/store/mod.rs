//! # Collaborator Contracts
//!
//! The core only depends on these traits. In-memory implementations in
//! [`memory`] back embedded use and the test-suite.

pub mod errors;
pub mod memory;
pub mod pagination;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::metadata::{Metadata, StepSummary, TelemetryData, Testrun, TestrunSummary};

pub use errors::{
    PaginationError, PersistenceError, PersistenceResult, StoreError, StoreResult, TelemetryError,
};
pub use memory::{MemorySummaryStore, MemoryTestrunStore, StaticTelemetrySource};
pub use pagination::{DashboardQuery, Page};

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Hosts the live testrun records
///
/// Updates are optimistic: they succeed only if the stored version still
/// equals `expected_version`.
#[async_trait]
pub trait TestrunStore: Send + Sync {
    /// Create a new record; a second successor of the same predecessor is rejected
    async fn create(&self, testrun: Testrun) -> StoreResult<Versioned<Testrun>>;

    async fn get(&self, id: &str) -> StoreResult<Versioned<Testrun>>;

    async fn update(
        &self,
        testrun: Testrun,
        expected_version: u64,
    ) -> StoreResult<Versioned<Testrun>>;

    /// The testrun whose `previous_attempt` is `id`, if any
    async fn find_successor(&self, id: &str) -> StoreResult<Option<Versioned<Testrun>>>;
}

/// Idempotent upserts of summaries keyed by composite ids
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn upsert_metadata(&self, key: &str, metadata: &Metadata) -> PersistenceResult<()>;

    async fn upsert_step_summary(&self, key: &str, summary: &StepSummary)
        -> PersistenceResult<()>;

    async fn upsert_testrun_summary(
        &self,
        key: &str,
        summary: &TestrunSummary,
    ) -> PersistenceResult<()>;

    async fn get_metadata(&self, key: &str) -> PersistenceResult<Option<Metadata>>;

    async fn get_step_summary(&self, key: &str) -> PersistenceResult<Option<StepSummary>>;

    async fn get_testrun_summary(&self, key: &str) -> PersistenceResult<Option<TestrunSummary>>;

    /// Testrun summaries of an execution group ordered by start time, then id
    async fn list_by_execution_group(
        &self,
        execution_group: &str,
        page: Page,
    ) -> PersistenceResult<Vec<TestrunSummary>>;
}

/// Time window a testrun ran in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Source of telemetry measured while a testrun ran
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// `Ok(None)` when nothing was recorded for the run
    async fn fetch(
        &self,
        testrun_id: &str,
        window: TimeWindow,
    ) -> Result<Option<TelemetryData>, TelemetryError>;
}
