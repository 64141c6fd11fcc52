use thiserror::Error;

/// Reasons a flow cannot be turned into an execution graph
///
/// Always fatal to the submission and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidFlowError {
    #[error("Flow contains no step groups")]
    EmptyFlow,

    #[error("Step group {group} contains no steps")]
    EmptyGroup { group: String },

    #[error("Duplicate step name: {step}")]
    DuplicateStep { step: String },

    #[error("Step {step} references unknown TestDefinition {definition}")]
    UnknownTestDefinition { step: String, definition: String },

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step {step} depends on {dependency}, which is not in an earlier group")]
    DependencyNotInEarlierGroup { step: String, dependency: String },

    #[error("Step {step} references configuration key {key} which is not set")]
    UnresolvedPlaceholder { step: String, key: String },

    #[error("Flow contains a dependency cycle between steps: {}", steps.join(", "))]
    Cycle { steps: Vec<String> },
}

pub type FlowResult<T> = Result<T, InvalidFlowError>;
