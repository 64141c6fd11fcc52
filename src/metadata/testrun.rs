//! Live testrun and step records.
//!
//! These are the mutable records hosted by the testrun store. Only the run
//! state tracker changes phases and timing, only the retry coordinator sets
//! lineage fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::dimension::Dimension;
use super::types::{ComponentDescriptor, Metadata, TestrunMetadata};
use crate::constants::{AnnotationKeys, DEFAULT_GENERATE_NAME};
use crate::flow::FlowSpec;
use crate::state_machine::{HoldState, StepPhase, TestrunPhase};

/// A submitted testrun with its steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Testrun {
    pub id: String,
    /// Prefix used when generating ids for successors
    pub generate_name: String,
    pub execution_group: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub retries: u32,
    pub previous_attempt: Option<String>,
    pub dimension: Dimension,
    pub configuration: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub component_descriptor: Option<ComponentDescriptor>,
    pub flow: FlowSpec,
    pub phase: TestrunPhase,
    pub steps: Vec<Step>,
    /// Pause and cancel signals currently applied to the run
    #[serde(default)]
    pub hold: HoldState,
    pub conditions: Vec<RunCondition>,
}

impl Testrun {
    /// Create a testrun with a generated id
    pub fn new(flow: FlowSpec) -> Self {
        Self::with_generate_name(DEFAULT_GENERATE_NAME, flow)
    }

    /// Create a testrun whose id starts with the given prefix
    pub fn with_generate_name(generate_name: impl Into<String>, flow: FlowSpec) -> Self {
        let generate_name = generate_name.into();
        Self {
            id: generate_id(&generate_name),
            generate_name,
            execution_group: None,
            start_time: None,
            completion_time: None,
            retries: 0,
            previous_attempt: None,
            dimension: Dimension::default(),
            configuration: BTreeMap::new(),
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            component_descriptor: None,
            flow,
            phase: TestrunPhase::Pending,
            steps: Vec::new(),
            hold: HoldState::default(),
            conditions: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Assign the testrun to an execution group; mirrored into the group label
    pub fn with_execution_group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.labels.insert(
            AnnotationKeys::standard().execution_group_label.to_string(),
            group.clone(),
        );
        self.execution_group = Some(group);
        self
    }

    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_component_descriptor(mut self, descriptor: ComponentDescriptor) -> Self {
        self.component_descriptor = Some(descriptor);
        self
    }

    /// Find a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| step.name == name)
    }

    /// Number of non-system steps that actually ran to a counted outcome
    pub fn tests_run(&self) -> u32 {
        let count = self
            .steps
            .iter()
            .filter(|step| !step.system_step)
            .filter(|step| step.phase == StepPhase::Succeeded || step.phase.is_failure())
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Run duration in seconds, measured up to completion or `now`
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> i64 {
        match self.start_time {
            Some(start) => (self.completion_time.unwrap_or(now) - start)
                .num_seconds()
                .max(0),
            None => 0,
        }
    }

    /// Attach a structured condition to the record
    pub fn add_condition(&mut self, kind: ConditionKind, message: impl Into<String>) {
        self.conditions.push(RunCondition {
            kind,
            message: message.into(),
            observed_at: Utc::now(),
        });
    }

    pub fn has_condition(&self, kind: ConditionKind) -> bool {
        self.conditions.iter().any(|condition| condition.kind == kind)
    }

    /// Metadata of this testrun as shared by all of its summaries
    ///
    /// Dimension values take precedence over their metadata annotations.
    pub fn metadata(&self) -> Metadata {
        let keys = AnnotationKeys::standard();
        let annotation = |key: &str| self.annotations.get(key).cloned().unwrap_or_default();
        let prefer = |value: &str, key: &str| {
            if value.is_empty() {
                annotation(key)
            } else {
                value.to_string()
            }
        };
        let dimension = &self.dimension;

        let allow_privileged_containers = dimension.allow_privileged_containers.or_else(|| {
            self.annotations
                .get(keys.allow_privileged_containers)
                .and_then(|value| value.trim().parse::<bool>().ok())
        });

        Metadata {
            flavor_description: prefer(&dimension.description, keys.flavor_description),
            landscape: annotation(keys.landscape),
            cloud_provider: prefer(&dimension.cloud_provider, keys.cloud_provider),
            kubernetes_version: prefer(&dimension.kubernetes_version, keys.k8s_version),
            region: prefer(&dimension.region, keys.region),
            operating_system: prefer(&dimension.operating_system, keys.operating_system),
            operating_system_version: prefer(
                &dimension.operating_system_version,
                keys.operating_system_version,
            ),
            container_runtime: prefer(&dimension.container_runtime, keys.container_runtime),
            zone: prefer(&dimension.zone, keys.zone),
            allow_privileged_containers,
            shoot_annotations: self
                .annotations
                .get(keys.shoot_annotations)
                .map(|value| parse_key_value_list(value))
                .unwrap_or_default(),
            component_descriptor: self.component_descriptor.clone(),
            testrun: TestrunMetadata {
                id: self.id.clone(),
                execution_group: self.execution_group.clone().unwrap_or_default(),
                start_time: self.start_time,
            },
            configuration: self.configuration.clone(),
            annotations: self.annotations.clone(),
            retries: self.retries,
            telemetry_data: None,
        }
    }
}

/// A step of a testrun, expanded from the flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub test_definition: String,
    pub system_step: bool,
    pub phase: StepPhase,
    pub start_time: Option<DateTime<Utc>>,
    /// Seconds
    pub duration: Option<i64>,
    /// Pod executing the step
    pub host_ref: Option<String>,
    pub labels: Vec<String>,
    /// Names of the steps that must succeed first
    pub dependencies: Vec<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, test_definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            test_definition: test_definition.into(),
            system_step: false,
            phase: StepPhase::Pending,
            start_time: None,
            duration: None,
            host_ref: None,
            labels: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

/// Kind of a structured condition attached to a testrun
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    InvalidTransition,
    RetryBudgetExhausted,
    /// The successor of a failed testrun could not be created
    RetryFailed,
    SummaryPersistenceDegraded,
    TelemetryUnavailable,
    StoreConflict,
}

/// A warning-level observation about a testrun
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCondition {
    pub kind: ConditionKind,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

/// Generate a testrun id from a name prefix
pub fn generate_id(generate_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{generate_name}{}", &suffix[..8])
}

fn parse_key_value_list(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}
