//! # Workflow Graph Builder
//!
//! Declarative flows, TestDefinitions and the execution DAG built from them.

pub mod builder;
pub mod definition;
pub mod errors;
pub mod graph;

pub use builder::WorkflowGraphBuilder;
pub use definition::{
    FlowSpec, FlowStep, InMemoryCatalog, StepGroup, TestDefinition, TestDefinitionCatalog,
};
pub use errors::{FlowResult, InvalidFlowError};
pub use graph::{EngineTask, EngineWorkflow, ExecutionGraph, StepNode};
