//! Execution DAG produced by the workflow graph builder.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::errors::{FlowResult, InvalidFlowError};
use crate::metadata::Step;

/// A step node ready to be handed to the workflow engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepNode {
    pub name: String,
    pub test_definition: String,
    pub system_step: bool,
    /// Index of the flow group the step came from
    pub group: usize,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub active_deadline_seconds: Option<u64>,
}

/// Directed acyclic graph of steps; an edge `(a, b)` means `a` must complete before `b`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionGraph {
    nodes: Vec<StepNode>,
    index: HashMap<String, usize>,
    edges: BTreeSet<(usize, usize)>,
    group_parallelism: Vec<Option<usize>>,
}

impl ExecutionGraph {
    pub(crate) fn new(group_parallelism: Vec<Option<usize>>) -> Self {
        Self {
            group_parallelism,
            ..Self::default()
        }
    }

    pub(crate) fn add_node(&mut self, node: StepNode) -> usize {
        let position = self.nodes.len();
        self.index.insert(node.name.clone(), position);
        self.nodes.push(node);
        position
    }

    pub(crate) fn add_edge(&mut self, from: usize, to: usize) {
        self.edges.insert((from, to));
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&StepNode> {
        self.position(name).map(|position| &self.nodes[position])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edges as `(from, to)` step names
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges.iter().map(|(from, to)| {
            (
                self.nodes[*from].name.as_str(),
                self.nodes[*to].name.as_str(),
            )
        })
    }

    /// Direct dependencies of a step
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        let Some(target) = self.position(name) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|(_, to)| *to == target)
            .map(|(from, _)| self.nodes[*from].name.as_str())
            .collect()
    }

    /// Steps that directly depend on the given step
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(source) = self.position(name) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|(from, _)| *from == source)
            .map(|(_, to)| self.nodes[*to].name.as_str())
            .collect()
    }

    /// Kahn's algorithm; fails with the steps left on a cycle
    pub fn topological_order(&self) -> FlowResult<Vec<&str>> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (from, to) in &self.edges {
            in_degree[*to] += 1;
            outgoing[*from].push(*to);
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(position, _)| position)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(position) = queue.pop_front() {
            order.push(self.nodes[position].name.as_str());
            for next in &outgoing[position] {
                in_degree[*next] -= 1;
                if in_degree[*next] == 0 {
                    queue.push_back(*next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let steps = in_degree
                .iter()
                .enumerate()
                .filter(|(_, degree)| **degree > 0)
                .map(|(position, _)| self.nodes[position].name.clone())
                .collect();
            return Err(InvalidFlowError::Cycle { steps });
        }

        Ok(order)
    }

    pub fn is_acyclic(&self) -> bool {
        self.topological_order().is_ok()
    }

    /// Fresh step records for a testrun, all `Pending`
    pub fn to_steps(&self) -> Vec<Step> {
        self.nodes
            .iter()
            .map(|node| {
                let mut step = Step::new(&node.name, &node.test_definition);
                step.system_step = node.system_step;
                step.labels = node.labels.clone();
                step.dependencies = self
                    .dependencies(&node.name)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                step
            })
            .collect()
    }

    /// Render the graph in the engine's DAG format
    pub fn to_engine_workflow(&self, name: impl Into<String>) -> EngineWorkflow {
        let tasks = self
            .nodes
            .iter()
            .map(|node| EngineTask {
                name: node.name.clone(),
                dependencies: self
                    .dependencies(&node.name)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                image: node.image.clone(),
                command: node.command.clone(),
                args: node.args.clone(),
                env: node.env.clone(),
                annotations: node.annotations.clone(),
                parallelism_hint: self.group_parallelism.get(node.group).copied().flatten(),
                active_deadline_seconds: node.active_deadline_seconds,
            })
            .collect();

        EngineWorkflow {
            name: name.into(),
            tasks,
        }
    }
}

/// DAG workflow in the engine's native shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineWorkflow {
    pub name: String,
    pub tasks: Vec<EngineTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineTask {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism_hint: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<u64>,
}
