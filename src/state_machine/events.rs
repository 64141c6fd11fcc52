use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::states::StepPhase;

/// Phase change of a step as reported by the workflow engine
///
/// Delivered at least once; ordering only holds per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPhaseEvent {
    #[serde(rename = "testrunID")]
    pub testrun_id: String,
    pub step_name: String,
    pub phase: StepPhase,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub host_ref: Option<String>,
}

impl StepPhaseEvent {
    pub fn new(
        testrun_id: impl Into<String>,
        step_name: impl Into<String>,
        phase: StepPhase,
    ) -> Self {
        Self {
            testrun_id: testrun_id.into(),
            step_name: step_name.into(),
            phase,
            start_time: None,
            duration: None,
            host_ref: None,
        }
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_duration(mut self, seconds: i64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_host_ref(mut self, host_ref: impl Into<String>) -> Self {
        self.host_ref = Some(host_ref.into());
        self
    }

    /// Composite idempotency key `testrunID/stepName/phase`
    pub fn dedup_key(&self) -> String {
        format!("{}/{}/{}", self.testrun_id, self.step_name, self.phase)
    }
}

/// Operator signals applied to a whole testrun
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSignal {
    Pause,
    Resume,
    Cancel,
}

impl RunSignal {
    /// Get a string representation of the signal for logging
    pub fn signal_type(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}
