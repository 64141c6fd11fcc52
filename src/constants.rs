//! # Annotations, Labels and System Constants
//!
//! The annotation and label keys in this module are the stable contract that
//! other TestMachinery tooling (testrunner, dashboard, telemetry controller)
//! reads from testrun records. Keys and their semantics must never change.
//!
//! Components do not hardcode these strings. They look them up in the frozen
//! [`AnnotationKeys`] table, shared by `&'static` reference through
//! [`AnnotationKeys::standard`].

use std::time::Duration;

/// Frozen table of every annotation and label key the orchestration core reads or writes.
#[derive(Debug, PartialEq, Eq)]
pub struct AnnotationKeys {
    /// Triggers resume of a paused testrun.
    pub resume_testrun: &'static str,
    /// Triggers collection and persistence of testrun results.
    pub collect_testrun: &'static str,
    /// Marks a testflow step as a system step; it does not count as a test.
    pub system_step: &'static str,
    /// Name of the origin TestDefinition.
    pub test_def_name: &'static str,
    /// Unique name of the origin TestDefinition in a specific flow and step.
    pub test_def_id: &'static str,
    /// Identifies TestMachinery dashboard ingress objects.
    pub dashboard_ingress_label: &'static str,

    pub testrun_purpose: &'static str,
    pub template_id: &'static str,
    /// Retry count of the current testrun.
    pub retries: &'static str,
    /// Testrun id of the previous attempt.
    pub previous_attempt: &'static str,
    pub landscape: &'static str,
    pub k8s_version: &'static str,
    pub cloud_provider: &'static str,
    pub container_runtime: &'static str,
    pub operating_system: &'static str,
    pub operating_system_version: &'static str,
    pub region: &'static str,
    pub zone: &'static str,
    pub allow_privileged_containers: &'static str,
    pub shoot_annotations: &'static str,
    pub flavor_description: &'static str,
    pub dimension: &'static str,
    pub group_purpose: &'static str,
    pub dashboard_url: &'static str,
    /// Label with the unique name of the run (all testruns of one testrunner invocation).
    pub execution_group_label: &'static str,
    pub uploaded_to_github_label: &'static str,
}

static STANDARD_KEYS: AnnotationKeys = AnnotationKeys {
    resume_testrun: "testmachinery.sapcloud.io/resume",
    collect_testrun: "testmachinery.garden.cloud/collect",
    system_step: "testmachinery.sapcloud.io/system-step",
    test_def_name: "testmachinery.sapcloud.io/TestDefinition",
    test_def_id: "testmachinery.sapcloud.io/ID",
    dashboard_ingress_label: "testmachinery.garden.cloud/tm-dashboard",

    testrun_purpose: "testmachinery.sapcloud.io/purpose",
    template_id: "testrunner.testmachinery.gardener.cloud/templateID",
    retries: "testrunner.testmachinery.gardener.cloud/retries",
    previous_attempt: "testrunner.testmachinery.gardener.cloud/previous-attempt",
    landscape: "metadata.testmachinery.gardener.cloud/landscape",
    k8s_version: "metadata.testmachinery.gardener.cloud/k8sVersion",
    cloud_provider: "metadata.testmachinery.gardener.cloud/cloudprovider",
    container_runtime: "metadata.testmachinery.gardener.cloud/container-runtime",
    operating_system: "metadata.testmachinery.gardener.cloud/operating-system",
    operating_system_version: "metadata.testmachinery.gardener.cloud/operating-system-version",
    region: "metadata.testmachinery.gardener.cloud/region",
    zone: "metadata.testmachinery.gardener.cloud/zone",
    allow_privileged_containers:
        "metadata.testmachinery.gardener.cloud/allow-privileged-containers",
    shoot_annotations: "metadata.testmachinery.gardener.cloud/shoot-annotations",
    flavor_description: "metadata.testmachinery.gardener.cloud/flavor-description",
    dimension: "metadata.testmachinery.gardener.cloud/dimension",
    group_purpose: "metadata.testmachinery.gardener.cloud/group-purpose",
    dashboard_url: "metadata.testmachinery.gardener.cloud/tm-dashboard-url",
    execution_group_label: "testrunner.testmachinery.gardener.cloud/execution-group",
    uploaded_to_github_label: "testrunner.testmachinery.sapcloud.io/uploaded-to-github",
};

impl AnnotationKeys {
    /// The process-wide key table.
    pub fn standard() -> &'static AnnotationKeys {
        &STANDARD_KEYS
    }
}

/// Dashboard HTTP surface.
pub mod dashboard {
    /// Query parameter carrying the execution group.
    pub const EXECUTION_GROUP_PARAMETER: &str = "runID";
    /// Pagination start index (inclusive).
    pub const PAGINATION_FROM: &str = "from";
    /// Pagination end index (exclusive).
    pub const PAGINATION_TO: &str = "to";
}

/// Lifecycle event names published on the event bus.
pub mod events {
    pub const TESTRUN_SUBMITTED: &str = "testrun.submitted";
    pub const TESTRUN_PHASE_CHANGED: &str = "testrun.phase_changed";
    pub const TESTRUN_PAUSED: &str = "testrun.paused";
    pub const TESTRUN_RESUMED: &str = "testrun.resumed";
    pub const TESTRUN_CANCELLED: &str = "testrun.cancelled";
    pub const TESTRUN_RETRY_SPAWNED: &str = "testrun.retry_spawned";
    pub const TESTRUN_RETRY_EXHAUSTED: &str = "testrun.retry_exhausted";

    pub const STEP_PHASE_CHANGED: &str = "step.phase_changed";
    pub const STEP_SKIPPED: &str = "step.skipped";
    pub const STEP_TRANSITION_REJECTED: &str = "step.transition_rejected";

    pub const SUMMARY_PERSISTED: &str = "summary.persisted";
    pub const SUMMARY_DEGRADED: &str = "summary.degraded";
}

/// How long a paused testrun waits for a resume signal before resuming on its own.
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(14_400);

/// Default name prefix for generated testrun ids.
pub const DEFAULT_GENERATE_NAME: &str = "tm-";

/// Score of a succeeded step in dashboard averages.
pub const PHASE_NUM_SUCCEEDED: i32 = 100;
/// Score of a failed or timed out step in dashboard averages.
pub const PHASE_NUM_FAILED: i32 = 0;

pub const LOGS_DISPLAY_NAME: &str = "logs";
pub const ARGO_DISPLAY_NAME: &str = "argo";
