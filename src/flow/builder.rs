//! # Workflow Graph Builder
//!
//! Expands a declarative [`FlowSpec`] into an [`ExecutionGraph`].
//!
//! Group order is a strict total order: every step of a group depends on all
//! steps of the previous group. Explicit `depends_on` references add further
//! edges. Building is pure; the same inputs always yield the same graph.

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::definition::{FlowSpec, TestDefinitionCatalog};
use super::errors::{FlowResult, InvalidFlowError};
use super::graph::{ExecutionGraph, StepNode};
use crate::constants::AnnotationKeys;
use crate::metadata::{Dimension, Testrun};

pub struct WorkflowGraphBuilder<'a> {
    catalog: &'a dyn TestDefinitionCatalog,
    keys: &'static AnnotationKeys,
}

impl<'a> WorkflowGraphBuilder<'a> {
    pub fn new(catalog: &'a dyn TestDefinitionCatalog) -> Self {
        Self {
            catalog,
            keys: AnnotationKeys::standard(),
        }
    }

    /// Build the execution graph for a flow
    pub fn build(
        &self,
        flow: &FlowSpec,
        dimension: &Dimension,
        configuration: &BTreeMap<String, String>,
    ) -> FlowResult<ExecutionGraph> {
        if flow.groups.is_empty() {
            return Err(InvalidFlowError::EmptyFlow);
        }

        let mut graph =
            ExecutionGraph::new(flow.groups.iter().map(|group| group.parallelism).collect());
        let mut seen = HashSet::new();
        let mut previous_group: Vec<usize> = Vec::new();

        for (group_index, group) in flow.groups.iter().enumerate() {
            if group.steps.is_empty() {
                return Err(InvalidFlowError::EmptyGroup {
                    group: group.name.clone(),
                });
            }

            let mut current_group = Vec::with_capacity(group.steps.len());
            for step in &group.steps {
                if !seen.insert(step.name.clone()) {
                    return Err(InvalidFlowError::DuplicateStep {
                        step: step.name.clone(),
                    });
                }

                let definition = self.catalog.get(&step.definition).ok_or_else(|| {
                    InvalidFlowError::UnknownTestDefinition {
                        step: step.name.clone(),
                        definition: step.definition.clone(),
                    }
                })?;

                let mut env = definition.config.clone();
                env.extend(step.config.clone());
                env.extend(configuration.clone());

                let args = definition
                    .args
                    .iter()
                    .map(|arg| render_template(arg, &env, dimension))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|key| InvalidFlowError::UnresolvedPlaceholder {
                        step: step.name.clone(),
                        key,
                    })?;

                let system_step = definition.system_step || step.system_step;
                let mut annotations = BTreeMap::new();
                annotations.insert(self.keys.test_def_name.to_string(), definition.name.clone());
                annotations.insert(
                    self.keys.test_def_id.to_string(),
                    format!("{}-{}", step.name, definition.name),
                );
                if system_step {
                    annotations.insert(self.keys.system_step.to_string(), "true".to_string());
                }

                let position = graph.add_node(StepNode {
                    name: step.name.clone(),
                    test_definition: definition.name.clone(),
                    system_step,
                    group: group_index,
                    image: definition.image.clone(),
                    command: definition.command.clone(),
                    args,
                    env,
                    labels: definition.labels.clone(),
                    annotations,
                    active_deadline_seconds: definition.active_deadline_seconds,
                });

                for upstream in &previous_group {
                    graph.add_edge(*upstream, position);
                }
                current_group.push(position);
            }
            previous_group = current_group;
        }

        for step in flow.steps() {
            let Some(position) = graph.position(&step.name) else {
                continue;
            };
            for dependency in &step.depends_on {
                let upstream = graph.position(dependency).ok_or_else(|| {
                    InvalidFlowError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                let (step_group, upstream_group) =
                    (graph.nodes()[position].group, graph.nodes()[upstream].group);
                if upstream_group >= step_group {
                    return Err(InvalidFlowError::DependencyNotInEarlierGroup {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
                graph.add_edge(upstream, position);
            }
        }

        graph.topological_order()?;

        debug!(
            steps = graph.len(),
            groups = flow.groups.len(),
            "Built execution graph"
        );

        Ok(graph)
    }

    /// Build the graph of a testrun from its own flow, dimension and configuration
    pub fn build_for(&self, testrun: &Testrun) -> FlowResult<ExecutionGraph> {
        self.build(&testrun.flow, &testrun.dimension, &testrun.configuration)
    }
}

/// Replace `${KEY}` placeholders; configuration wins over dimension values.
/// Returns the first unresolved key as error.
fn render_template(
    input: &str,
    env: &BTreeMap<String, String>,
    dimension: &Dimension,
) -> Result<String, String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let Some(length) = rest[start + 2..].find('}') else {
            break;
        };
        let key = &rest[start + 2..start + 2 + length];
        let value = env.get(key).map(String::as_str).or_else(|| {
            dimension
                .template_values()
                .into_iter()
                .find(|(name, value)| *name == key && !value.is_empty())
                .map(|(_, value)| value)
        });
        let Some(value) = value else {
            return Err(key.to_string());
        };

        output.push_str(&rest[..start]);
        output.push_str(value);
        rest = &rest[start + 3 + length..];
    }

    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowStep, InMemoryCatalog, StepGroup, TestDefinition};

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::new()
            .with(TestDefinition::new("create-shoot", "tm-base").system())
            .with(
                TestDefinition::new("conformance", "tm-conformance")
                    .with_args(["--provider=${cloudprovider}", "--focus=${FOCUS}"])
                    .with_config("FOCUS", "default")
                    .with_label("default"),
            )
            .with(TestDefinition::new("e2e", "tm-e2e"))
    }

    #[test]
    fn test_groups_form_total_order() {
        let catalog = catalog();
        let flow = FlowSpec::new(vec![
            StepGroup::new("setup", vec![FlowStep::new("create", "create-shoot")]),
            StepGroup::new(
                "tests",
                vec![
                    FlowStep::new("a", "conformance"),
                    FlowStep::new("b", "e2e"),
                ],
            ),
            StepGroup::new("post", vec![FlowStep::new("c", "e2e")]),
        ]);

        let graph = WorkflowGraphBuilder::new(&catalog)
            .build(&flow, &Dimension::new("gcp", "1.16.3"), &BTreeMap::new())
            .unwrap();

        assert_eq!(graph.dependencies("a"), vec!["create"]);
        assert_eq!(graph.dependencies("b"), vec!["create"]);
        assert_eq!(graph.dependencies("c"), vec!["a", "b"]);
        assert!(graph.node("create").unwrap().system_step);
        assert!(!graph.node("a").unwrap().system_step);
    }

    #[test]
    fn test_args_are_templated_with_precedence() {
        let catalog = catalog();
        let flow = FlowSpec::new(vec![StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "conformance").with_config("FOCUS", "step")],
        )]);

        let mut configuration = BTreeMap::new();
        let builder = WorkflowGraphBuilder::new(&catalog);
        let dimension = Dimension::new("aws", "1.18");

        let graph = builder.build(&flow, &dimension, &configuration).unwrap();
        assert_eq!(
            graph.node("a").unwrap().args,
            vec!["--provider=aws", "--focus=step"]
        );

        configuration.insert("FOCUS".to_string(), "run".to_string());
        let graph = builder.build(&flow, &dimension, &configuration).unwrap();
        assert_eq!(graph.node("a").unwrap().args[1], "--focus=run");
        assert_eq!(graph.node("a").unwrap().env["FOCUS"], "run");
    }

    #[test]
    fn test_annotations_mark_definition_and_system_steps() {
        let catalog = catalog();
        let keys = AnnotationKeys::standard();
        let flow = FlowSpec::new(vec![StepGroup::new(
            "setup",
            vec![
                FlowStep::new("create", "create-shoot"),
                FlowStep::new("prepare", "e2e").system(),
            ],
        )]);

        let graph = WorkflowGraphBuilder::new(&catalog)
            .build(&flow, &Dimension::default(), &BTreeMap::new())
            .unwrap();

        let create = graph.node("create").unwrap();
        assert_eq!(create.annotations[keys.test_def_name], "create-shoot");
        assert_eq!(create.annotations[keys.test_def_id], "create-create-shoot");
        assert_eq!(create.annotations[keys.system_step], "true");
        assert!(graph.node("prepare").unwrap().system_step);
    }

    #[test]
    fn test_unknown_definition_is_rejected() {
        let catalog = catalog();
        let flow = FlowSpec::new(vec![StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "missing")],
        )]);

        let err = WorkflowGraphBuilder::new(&catalog)
            .build(&flow, &Dimension::default(), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(
            err,
            InvalidFlowError::UnknownTestDefinition {
                step: "a".to_string(),
                definition: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_unresolved_placeholder_is_rejected() {
        let catalog = catalog();
        let flow = FlowSpec::new(vec![StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "conformance")],
        )]);

        let err = WorkflowGraphBuilder::new(&catalog)
            .build(&flow, &Dimension::default(), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            InvalidFlowError::UnresolvedPlaceholder { ref key, .. } if key == "cloudprovider"
        ));
    }

    #[test]
    fn test_structural_errors() {
        let catalog = catalog();
        let builder = WorkflowGraphBuilder::new(&catalog);
        let dimension = Dimension::default();
        let configuration = BTreeMap::new();

        assert_eq!(
            builder
                .build(&FlowSpec::default(), &dimension, &configuration)
                .unwrap_err(),
            InvalidFlowError::EmptyFlow
        );

        let empty_group = FlowSpec::new(vec![StepGroup::new("empty", Vec::new())]);
        assert!(matches!(
            builder.build(&empty_group, &dimension, &configuration),
            Err(InvalidFlowError::EmptyGroup { .. })
        ));

        let duplicate = FlowSpec::new(vec![
            StepGroup::new("one", vec![FlowStep::new("a", "e2e")]),
            StepGroup::new("two", vec![FlowStep::new("a", "e2e")]),
        ]);
        assert!(matches!(
            builder.build(&duplicate, &dimension, &configuration),
            Err(InvalidFlowError::DuplicateStep { .. })
        ));

        let dangling = FlowSpec::new(vec![StepGroup::new(
            "one",
            vec![FlowStep::new("a", "e2e").depends_on("ghost")],
        )]);
        assert!(matches!(
            builder.build(&dangling, &dimension, &configuration),
            Err(InvalidFlowError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_dependency_on_later_group_is_rejected() {
        let catalog = catalog();
        let flow = FlowSpec::new(vec![
            StepGroup::new("one", vec![FlowStep::new("a", "e2e").depends_on("b")]),
            StepGroup::new("two", vec![FlowStep::new("b", "e2e")]),
        ]);

        let err = WorkflowGraphBuilder::new(&catalog)
            .build(&flow, &Dimension::default(), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(
            err,
            InvalidFlowError::DependencyNotInEarlierGroup {
                step: "a".to_string(),
                dependency: "b".to_string(),
            }
        );
    }

    #[test]
    fn test_dependency_within_group_is_rejected() {
        let catalog = catalog();
        let flow = FlowSpec::new(vec![StepGroup::new(
            "tests",
            vec![FlowStep::new("a", "e2e").depends_on("b"), FlowStep::new("b", "e2e")],
        )]);

        let err = WorkflowGraphBuilder::new(&catalog)
            .build(&flow, &Dimension::default(), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            InvalidFlowError::DependencyNotInEarlierGroup { ref step, ref dependency }
                if step == "a" && dependency == "b"
        ));
    }

    #[test]
    fn test_dependency_on_earlier_group_adds_edge() {
        let catalog = catalog();
        let flow = FlowSpec::new(vec![
            StepGroup::new("setup", vec![FlowStep::new("create", "create-shoot")]),
            StepGroup::new("tests", vec![FlowStep::new("a", "e2e")]),
            StepGroup::new("post", vec![FlowStep::new("c", "e2e").depends_on("create")]),
        ]);

        let graph = WorkflowGraphBuilder::new(&catalog)
            .build(&flow, &Dimension::default(), &BTreeMap::new())
            .unwrap();
        let mut dependencies = graph.dependencies("c");
        dependencies.sort();
        assert_eq!(dependencies, vec!["a", "create"]);
    }

    #[test]
    fn test_render_template_keeps_unterminated_placeholder() {
        let env = BTreeMap::new();
        assert_eq!(
            render_template("value ${open", &env, &Dimension::default()).unwrap(),
            "value ${open"
        );
        assert_eq!(
            render_template("${zone}-x", &env, &Dimension::default().with_zone("eu-1a")).unwrap(),
            "eu-1a-x"
        );
    }
}
