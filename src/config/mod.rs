//! # Orchestrator Configuration
//!
//! All tunables of the orchestration core. Every section has defaults, so an
//! empty source yields a working configuration. Values come from an optional
//! file and `TM__` prefixed environment variables, see [`ConfigLoader`].
//!
//! ```rust,no_run
//! use testmachinery::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().with_file("testmachinery.toml").load()?;
//! assert!(config.persistence.max_attempts > 0);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Root configuration of the orchestration core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryConfig,
    pub persistence: PersistenceConfig,
    pub telemetry: TelemetryConfig,
    pub tracker: TrackerConfig,
    pub dashboard: DashboardConfig,
    pub events: EventsConfig,
}

impl OrchestratorConfig {
    /// Reject values the core cannot operate with
    pub fn validate(&self) -> ConfigResult<()> {
        let persistence = &self.persistence;
        if persistence.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "persistence.max_attempts",
                persistence.max_attempts,
                "at least one attempt is required",
            ));
        }
        if persistence.attempt_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "persistence.attempt_timeout_ms",
                persistence.attempt_timeout_ms,
                "must be positive",
            ));
        }
        if !persistence.backoff_multiplier.is_finite() || persistence.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "persistence.backoff_multiplier",
                persistence.backoff_multiplier,
                "must be a finite number >= 1.0",
            ));
        }
        if persistence.max_delay_ms < persistence.base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "persistence.max_delay_ms",
                persistence.max_delay_ms,
                format!(
                    "must not be smaller than base_delay_ms ({})",
                    persistence.base_delay_ms
                ),
            ));
        }
        if persistence.queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "persistence.queue_capacity",
                persistence.queue_capacity,
                "must be positive",
            ));
        }
        if self.telemetry.enabled && self.telemetry.timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "telemetry.timeout_ms",
                self.telemetry.timeout_ms,
                "must be positive when telemetry is enabled",
            ));
        }
        if self.tracker.pause_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "tracker.pause_timeout_seconds",
                self.tracker.pause_timeout_seconds,
                "must be positive",
            ));
        }
        if self.dashboard.page_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "dashboard.page_size",
                self.dashboard.page_size,
                "must be positive",
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                self.events.channel_capacity,
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Which steps a successor testrun re-runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Rebuild the whole flow
    #[default]
    Full,
    /// Only system steps plus test steps that failed or timed out
    Partial,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Successors allowed per lineage; 0 disables retries
    pub max_retries: u32,
    pub mode: RetryMode,
}

/// Bounded retry of summary persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub attempt_timeout_ms: u64,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Capacity of the queue between tracker and collector worker
    pub queue_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 5_000,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            max_attempts: 5,
            queue_capacity: 1_024,
        }
    }
}

impl PersistenceConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 2_000,
        }
    }
}

impl TelemetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub pause_timeout_seconds: u64,
    /// Re-read attempts after an optimistic concurrency conflict
    pub store_conflict_retries: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            pause_timeout_seconds: crate::constants::DEFAULT_PAUSE_TIMEOUT.as_secs(),
            store_conflict_retries: 5,
        }
    }
}

impl TrackerConfig {
    pub fn pause_timeout(&self) -> Duration {
        Duration::from_secs(self.pause_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Domain shown next to step summaries
    pub cluster_domain: String,
    /// Entries per page when `to` is not given
    pub page_size: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            cluster_domain: String::new(),
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_000,
        }
    }
}
