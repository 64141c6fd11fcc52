//! Crate level error type.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::flow::InvalidFlowError;
use crate::state_machine::StateMachineError;
use crate::store::{PaginationError, PersistenceError, StoreError, TelemetryError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TestMachineryError {
    #[error("Invalid flow: {0}")]
    InvalidFlow(#[from] InvalidFlowError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateMachineError),

    #[error("Testrun store error: {0}")]
    Store(#[from] StoreError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Pagination error: {0}")]
    Pagination(#[from] PaginationError),

    /// Successor does not continue its lineage
    #[error("Lineage violation: {0}")]
    Lineage(String),

    #[error("Orchestrator is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TestMachineryError>;
