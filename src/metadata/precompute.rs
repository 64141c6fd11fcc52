//! Derivation of the dashboard `pre` fields of a step summary.
//!
//! Everything here is a pure function of phase, dimension and configuration so
//! that the fields can be recomputed at any time.

use super::dimension::Dimension;
use super::types::StepPreComputed;
use crate::constants::{
    ARGO_DISPLAY_NAME, LOGS_DISPLAY_NAME, PHASE_NUM_FAILED, PHASE_NUM_SUCCEEDED,
};
use crate::state_machine::StepPhase;

/// Build the precomputed fields for a step in the given phase
pub fn precompute(phase: StepPhase, dimension: &Dimension, cluster_domain: &str) -> StepPreComputed {
    StepPreComputed {
        phase_num: phase_num(phase),
        k8s_major_minor_version: k8s_major_minor_version(&dimension.kubernetes_version)
            .unwrap_or_default(),
        logs_display_name: LOGS_DISPLAY_NAME.to_string(),
        argo_display_name: ARGO_DISPLAY_NAME.to_string(),
        cluster_domain: cluster_domain.to_string(),
        provider_enhanced: provider_enhanced(dimension),
    }
}

/// Numeric phase score; only outcomes that say something about the test are scored
pub fn phase_num(phase: StepPhase) -> Option<i32> {
    match phase {
        StepPhase::Succeeded => Some(PHASE_NUM_SUCCEEDED),
        StepPhase::Failed | StepPhase::Timeout => Some(PHASE_NUM_FAILED),
        _ => None,
    }
}

/// Truncate a kubernetes version to `major.minor`
///
/// `"1.16.3"` and `"1.16"` both yield `"1.16"`. Versions without a minor part
/// yield `None`.
pub fn k8s_major_minor_version(version: &str) -> Option<String> {
    let mut parts = version.trim().split('.');
    let major = parts.next().filter(|part| !part.is_empty())?;
    let minor = parts.next().filter(|part| !part.is_empty())?;
    Some(format!("{major}.{minor}"))
}

/// Provider name enriched with dimension aspects, e.g. `azure_multizone(NoPrivCtrs)`
pub fn provider_enhanced(dimension: &Dimension) -> String {
    if dimension.cloud_provider.is_empty() {
        return String::new();
    }
    let mut provider = dimension.cloud_provider.clone();
    if dimension.zone_count() > 1 {
        provider.push_str("_multizone");
    }
    if dimension.allow_privileged_containers == Some(false) {
        provider.push_str("(NoPrivCtrs)");
    }
    provider
}
