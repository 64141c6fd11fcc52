//! Test dimension value object.

use serde::{Deserialize, Serialize};

/// Describes the landscape dimension a testrun is testing.
///
/// Purely a classification value: two dimensions are equal when all of their
/// fields are equal, and a dimension is never mutated once a testrun carries it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(
        rename = "cloudprovider",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub cloud_provider: String,
    #[serde(
        rename = "k8sVersion",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub kubernetes_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operating_system: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operating_system_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_runtime: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    /// A single zone, or a comma separated list for multi-zone setups.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_privileged_containers: Option<bool>,
}

impl Dimension {
    pub fn new(cloud_provider: impl Into<String>, kubernetes_version: impl Into<String>) -> Self {
        Self {
            cloud_provider: cloud_provider.into(),
            kubernetes_version: kubernetes_version.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_operating_system(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.operating_system = name.into();
        self.operating_system_version = version.into();
        self
    }

    pub fn with_container_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.container_runtime = runtime.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn with_allow_privileged_containers(mut self, allow: bool) -> Self {
        self.allow_privileged_containers = Some(allow);
        self
    }

    /// Number of zones the dimension spans.
    pub fn zone_count(&self) -> usize {
        self.zone
            .split(',')
            .filter(|zone| !zone.trim().is_empty())
            .count()
    }

    /// Values that flow step arguments may reference as `${key}` placeholders.
    pub fn template_values(&self) -> [(&'static str, &str); 7] {
        [
            ("cloudprovider", self.cloud_provider.as_str()),
            ("k8sVersion", self.kubernetes_version.as_str()),
            ("operating_system", self.operating_system.as_str()),
            ("operating_system_version", self.operating_system_version.as_str()),
            ("container_runtime", self.container_runtime.as_str()),
            ("region", self.region.as_str()),
            ("zone", self.zone.as_str()),
        ]
    }
}
