#![allow(clippy::doc_markdown)] // Allow technical terms like TestMachinery, TestDefinition in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # TestMachinery Core
//!
//! Testrun orchestration and result aggregation for TestMachinery.
//!
//! ## Overview
//!
//! A testrun is a declarative flow of step groups, each step referencing a
//! TestDefinition. The core expands the flow into an execution DAG for the
//! workflow engine, tracks step and testrun phases from the engine's events,
//! retries failed testruns as a lineage of successors and collects per-step
//! and per-run summaries for the dashboard.
//!
//! ## Module Organization
//!
//! - [`metadata`] - Testrun, step, dimension and summary types
//! - [`flow`] - Flow definitions and the workflow graph builder
//! - [`state_machine`] - Step transitions, aggregate phase, pause and cancel
//! - [`orchestration`] - Tracker, retry coordinator, result collector and orchestrator
//! - [`store`] - Collaborator contracts and in-memory implementations
//! - [`config`] - Layered configuration
//! - [`events`] - Lifecycle event publisher
//! - [`constants`] - Frozen annotation and label keys
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testmachinery::config::OrchestratorConfig;
//! use testmachinery::flow::{FlowSpec, FlowStep, InMemoryCatalog, StepGroup, TestDefinition};
//! use testmachinery::metadata::Testrun;
//! use testmachinery::orchestration::{Collaborators, Orchestrator};
//! use testmachinery::state_machine::{StepPhase, StepPhaseEvent};
//!
//! # async fn example() -> testmachinery::Result<()> {
//! let catalog = Arc::new(InMemoryCatalog::new().with(TestDefinition::new("e2e", "tm-e2e")));
//! let orchestrator =
//!     Orchestrator::start(OrchestratorConfig::default(), Collaborators::in_memory(catalog))?;
//!
//! let flow = FlowSpec::new(vec![StepGroup::new("tests", vec![FlowStep::new("a", "e2e")])]);
//! let submission = orchestrator.submit(Testrun::new(flow)).await?;
//!
//! let id = submission.testrun.id.clone();
//! orchestrator
//!     .handle_event(StepPhaseEvent::new(&id, "a", StepPhase::Running))
//!     .await?;
//! orchestrator
//!     .handle_event(StepPhaseEvent::new(&id, "a", StepPhase::Succeeded))
//!     .await?;
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod flow;
pub mod logging;
pub mod metadata;
pub mod orchestration;
pub mod state_machine;
pub mod store;

pub use crate::config::{ConfigLoader, OrchestratorConfig, RetryMode};
pub use crate::constants::AnnotationKeys;
pub use crate::error::{Result, TestMachineryError};
pub use crate::flow::{EngineWorkflow, FlowSpec, WorkflowGraphBuilder};
pub use crate::metadata::{Dimension, Metadata, Step, StepSummary, Testrun, TestrunSummary};
pub use crate::orchestration::{Collaborators, Orchestrator, RetryDecision};
pub use crate::state_machine::{RunSignal, StepPhase, StepPhaseEvent, TestrunPhase};
