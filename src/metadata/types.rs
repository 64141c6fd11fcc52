//! # Summary Wire Schema
//!
//! JSON shapes exchanged with the results persistence and the dashboard.
//! Field names are part of the external contract: dashboards and scripted
//! fields address them directly, so renames here are breaking changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

use super::dimension::Dimension;
use crate::state_machine::{StepPhase, TestrunPhase};

/// Type of a result document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    Testrun,
    Teststep,
}

/// Component descriptor of the landscape-setup components ("bill of materials").
///
/// The core never looks inside. The already-serialized document is passed
/// through byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentDescriptor(Box<RawValue>);

impl ComponentDescriptor {
    pub fn from_json(json: impl Into<String>) -> Result<Self, serde_json::Error> {
        RawValue::from_string(json.into()).map(Self)
    }

    pub fn as_json(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for ComponentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.as_json() == other.as_json()
    }
}

/// Common metadata of all outputs and summaries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flavor_description: String,

    /// dev, staging, canary, office or live
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub landscape: String,
    #[serde(
        rename = "cloudprovider",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub cloud_provider: String,
    #[serde(
        rename = "k8s_version",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub kubernetes_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operating_system: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operating_system_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_runtime: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_privileged_containers: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shoot_annotations: BTreeMap<String, String>,

    #[serde(rename = "bom", default, skip_serializing_if = "Option::is_none")]
    pub component_descriptor: Option<ComponentDescriptor>,

    #[serde(rename = "tr")]
    pub testrun: TestrunMetadata,

    #[serde(rename = "config", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configuration: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,

    /// Internal hand-over only, never serialized.
    #[serde(skip)]
    pub telemetry_data: Option<TelemetryData>,
}

impl Metadata {
    /// Dimension the metadata describes
    pub fn dimension(&self) -> Dimension {
        Dimension {
            description: self.flavor_description.clone(),
            cloud_provider: self.cloud_provider.clone(),
            kubernetes_version: self.kubernetes_version.clone(),
            operating_system: self.operating_system.clone(),
            operating_system_version: self.operating_system_version.clone(),
            container_runtime: self.container_runtime.clone(),
            region: self.region.clone(),
            zone: self.zone.clone(),
            allow_privileged_containers: self.allow_privileged_containers,
        }
    }
}

/// Identity of the testrun a summary belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestrunMetadata {
    pub id: String,

    #[serde(
        rename = "executionGroup",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub execution_group: String,

    #[serde(rename = "startTime", default)]
    pub start_time: Option<DateTime<Utc>>,
}

/// Metadata for a specific step result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSummaryMetadata {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(rename = "stepName", default, skip_serializing_if = "String::is_empty")]
    pub step_name: String,
    #[serde(
        rename = "testdefinition",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub test_def_name: String,
}

/// Metadata of one step of a testrun as exported next to its artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExportMetadata {
    #[serde(flatten)]
    pub summary_metadata: StepSummaryMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<StepPhase>,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub duration: i64,
    #[serde(rename = "podName", default)]
    pub pod_name: String,
}

/// Result of the overall testrun
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestrunSummary {
    #[serde(rename = "tm", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(rename = "type")]
    pub summary_type: SummaryType,
    pub phase: TestrunPhase,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub duration: i64,
    #[serde(rename = "testsRun", default, skip_serializing_if = "is_zero")]
    pub tests_run: u32,
    #[serde(rename = "telemetry", default, skip_serializing_if = "Option::is_none")]
    pub telemetry_data: Option<TelemetryData>,
}

/// Result of a specific step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    #[serde(rename = "tm", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StepSummaryMetadata>,
    #[serde(rename = "type")]
    pub summary_type: SummaryType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "stepName", default, skip_serializing_if = "String::is_empty")]
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub phase: StepPhase,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub duration: i64,
    #[serde(rename = "pre", default, skip_serializing_if = "Option::is_none")]
    pub pre_computed: Option<StepPreComputed>,
}

/// Fields a dashboard could script at query time, stored precomputed instead
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPreComputed {
    /// Failed and Timeout map to 0, Succeeded to 100; allows averaging success rates
    #[serde(rename = "phaseNum", default, skip_serializing_if = "Option::is_none")]
    pub phase_num: Option<i32>,
    /// Kubernetes version without the patch suffix, e.g. "1.16"
    #[serde(
        rename = "k8sMajMinVer",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub k8s_major_minor_version: String,
    #[serde(rename = "logsText", default, skip_serializing_if = "String::is_empty")]
    pub logs_display_name: String,
    #[serde(rename = "argoText", default, skip_serializing_if = "String::is_empty")]
    pub argo_display_name: String,
    #[serde(
        rename = "clusterDomain",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub cluster_domain: String,
    /// e.g. azure_multizone(NoPrivCtrs)
    #[serde(
        rename = "providerEnhanced",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub provider_enhanced: String,
}

/// Telemetry measured for the tested cluster during a testrun
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<TelemetryResponseTimeDuration>,
    #[serde(rename = "downtime", default, skip_serializing_if = "Option::is_none")]
    pub downtime_periods: Option<TelemetryDowntimePeriods>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryResponseTimeDuration {
    pub min: i64,
    pub max: i64,
    pub avg: i64,
    pub median: i64,
    pub std: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryDowntimePeriods {
    pub min: i64,
    pub max: i64,
    pub avg: i64,
    pub median: i64,
    pub std: i64,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}
