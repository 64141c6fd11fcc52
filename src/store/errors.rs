use thiserror::Error;

/// Errors of the testrun record store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Testrun {id} already exists")]
    AlreadyExists { id: String },

    #[error("Testrun {id} not found")]
    NotFound { id: String },

    /// Optimistic concurrency check failed; re-read and retry
    #[error("Version conflict on testrun {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Testrun {predecessor} already has successor {successor}")]
    SuccessorExists {
        predecessor: String,
        successor: String,
    },

    #[error("Testrun store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors of summary persistence
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Transient persistence failure: {0}")]
    Transient(String),

    #[error("Permanent persistence failure: {0}")]
    Permanent(String),

    #[error("Persistence attempt timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PersistenceError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors of the telemetry collaborator; never fatal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Telemetry source unavailable: {0}")]
    Unavailable(String),

    #[error("Telemetry fetch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Invalid dashboard query parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaginationError {
    #[error("Missing query parameter {0}")]
    MissingParameter(&'static str),

    #[error("Query parameter {parameter} is not an index: {value}")]
    InvalidIndex {
        parameter: &'static str,
        value: String,
    },

    #[error("Pagination range is inverted: from {from} > to {to}")]
    InvertedRange { from: usize, to: usize },
}
