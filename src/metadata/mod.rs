//! # Metadata Model
//!
//! Value types describing a testrun, its steps and the summaries derived from
//! them. Every other component depends on this module; it depends on nothing
//! but the phase enums of the state machine and the flow definition.

pub mod dimension;
pub mod precompute;
pub mod testrun;
pub mod types;

pub use dimension::Dimension;
pub use precompute::{k8s_major_minor_version, phase_num, precompute, provider_enhanced};
pub use testrun::{generate_id, ConditionKind, RunCondition, Step, Testrun};
pub use types::{
    ComponentDescriptor, Metadata, StepExportMetadata, StepPreComputed, StepSummary,
    StepSummaryMetadata, SummaryType, TelemetryData, TelemetryDowntimePeriods,
    TelemetryResponseTimeDuration, TestrunMetadata, TestrunSummary,
};
