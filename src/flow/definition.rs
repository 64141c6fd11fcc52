//! Declarative flow and TestDefinition types.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Ordered list of step groups
///
/// Group *i* runs after every step of group *i-1* finished. Steps inside a
/// group have no order relative to each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub groups: Vec<StepGroup>,
}

impl FlowSpec {
    pub fn new(groups: Vec<StepGroup>) -> Self {
        Self { groups }
    }

    /// All steps in flow order
    pub fn steps(&self) -> impl Iterator<Item = &FlowStep> {
        self.groups.iter().flat_map(|group| group.steps.iter())
    }

    pub fn find_step(&self, name: &str) -> Option<&FlowStep> {
        self.steps().find(|step| step.name == name)
    }

    pub fn step_count(&self) -> usize {
        self.groups.iter().map(|group| group.steps.len()).sum()
    }

    /// Copy of the flow that only contains the steps accepted by `keep`
    ///
    /// Groups left without steps are dropped and explicit dependencies on
    /// removed steps are cut, so the result is a valid flow again.
    pub fn retain_steps<F>(&self, mut keep: F) -> FlowSpec
    where
        F: FnMut(&FlowStep) -> bool,
    {
        let groups: Vec<StepGroup> = self
            .groups
            .iter()
            .filter_map(|group| {
                let steps: Vec<FlowStep> =
                    group.steps.iter().filter(|step| keep(step)).cloned().collect();
                (!steps.is_empty()).then(|| StepGroup {
                    name: group.name.clone(),
                    steps,
                    parallelism: group.parallelism,
                })
            })
            .collect();

        let kept: HashSet<String> = groups
            .iter()
            .flat_map(|group| group.steps.iter().map(|step| step.name.clone()))
            .collect();

        let groups = groups
            .into_iter()
            .map(|mut group| {
                for step in &mut group.steps {
                    step.depends_on.retain(|dependency| kept.contains(dependency));
                }
                group
            })
            .collect();

        FlowSpec { groups }
    }
}

/// Group of steps that share a position in the flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepGroup {
    pub name: String,
    pub steps: Vec<FlowStep>,
    /// Upper bound of concurrently running steps handed to the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

impl StepGroup {
    pub fn new(name: impl Into<String>, steps: Vec<FlowStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            parallelism: None,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }
}

/// One step of a flow, referencing a TestDefinition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStep {
    pub name: String,
    pub definition: String,
    /// Marks the step as orchestration machinery even if the definition does not
    #[serde(default)]
    pub system_step: bool,
    /// Additional steps that must succeed first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl FlowStep {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
            system_step: false,
            depends_on: Vec::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn system(mut self) -> Self {
        self.system_step = true;
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Container level description of a test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    /// May contain `${KEY}` placeholders
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Setup/teardown machinery rather than a test
    #[serde(default)]
    pub system_step: bool,
    #[serde(default)]
    pub active_deadline_seconds: Option<u64>,
    /// Default configuration, overridden by the flow step and the run
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl TestDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            args: Vec::new(),
            labels: Vec::new(),
            system_step: false,
            active_deadline_seconds: None,
            config: BTreeMap::new(),
        }
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn system(mut self) -> Self {
        self.system_step = true;
        self
    }
}

/// Lookup of TestDefinitions by name
pub trait TestDefinitionCatalog: Send + Sync {
    fn get(&self, name: &str) -> Option<TestDefinition>;
}

/// Catalog backed by a map
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    definitions: HashMap<String, TestDefinition>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: TestDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn with(mut self, definition: TestDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl TestDefinitionCatalog for InMemoryCatalog {
    fn get(&self, name: &str) -> Option<TestDefinition> {
        self.definitions.get(name).cloned()
    }
}
