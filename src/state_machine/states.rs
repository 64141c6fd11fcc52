use serde::{Deserialize, Serialize};
use std::fmt;

/// Step phase as reported by the workflow engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepPhase {
    /// Step is created but not started
    Pending,
    /// Step is executing on a host
    Running,
    /// Step finished successfully
    Succeeded,
    /// Step finished with a failure
    Failed,
    /// Step exceeded its deadline
    Timeout,
    /// Step never ran (upstream failure or cancellation)
    Skipped,
}

impl StepPhase {
    /// Check if this is a terminal phase (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Skipped
        )
    }

    /// Check if this phase counts as a failed test
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    /// Check if the step is currently executing
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if this step satisfies dependencies for downstream steps
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Check if downstream steps can no longer run
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Timeout => "Timeout",
            Self::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            "Timeout" => Ok(Self::Timeout),
            "Skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid step phase: {s}")),
        }
    }
}

impl Default for StepPhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// Aggregate testrun phase derived from its step phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestrunPhase {
    /// No step has started yet
    Pending,
    /// At least one step is still pending or running
    Running,
    /// Every test step succeeded
    Succeeded,
    /// A test or system step failed or timed out
    Failed,
    /// Steps were skipped without any failure
    Cancelled,
}

impl TestrunPhase {
    /// Check if this is a terminal phase
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TestrunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestrunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid testrun phase: {s}")),
        }
    }
}

impl Default for TestrunPhase {
    fn default() -> Self {
        Self::Pending
    }
}
