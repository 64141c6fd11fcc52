mod common;

use common::strategies::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

use testmachinery::flow::{InvalidFlowError, WorkflowGraphBuilder};
use testmachinery::metadata::{k8s_major_minor_version, Dimension, Step};
use testmachinery::state_machine::{
    aggregate_phase, GuardContext, StepPhase, StepPhaseEvent, StepStateMachine, TestrunPhase,
};
use testmachinery::store::Page;

proptest! {
    /// Property: graphs built from valid flows are acyclic and only point forward in group order
    #[test]
    fn built_graphs_are_acyclic(flow in flow_strategy()) {
        let catalog = common::catalog();
        let graph = WorkflowGraphBuilder::new(catalog.as_ref())
            .build(&flow, &Dimension::default(), &BTreeMap::new())
            .unwrap();

        prop_assert!(graph.is_acyclic());
        prop_assert_eq!(graph.len(), flow.step_count());
        for (from, to) in graph.edges() {
            let from = graph.node(from).unwrap();
            let to = graph.node(to).unwrap();
            prop_assert!(from.group < to.group, "edge {} -> {} goes backwards", from.name, to.name);
        }
    }

    /// Property: steps of a later group depend on every step of the previous group
    #[test]
    fn groups_are_totally_ordered(flow in flow_strategy()) {
        let catalog = common::catalog();
        let graph = WorkflowGraphBuilder::new(catalog.as_ref())
            .build(&flow, &Dimension::default(), &BTreeMap::new())
            .unwrap();

        for window in flow.groups.windows(2) {
            for step in &window[1].steps {
                let dependencies = graph.dependencies(&step.name);
                for upstream in &window[0].steps {
                    prop_assert!(dependencies.contains(&upstream.name.as_str()));
                }
            }
        }
    }

    /// Property: explicit dependencies on the own or a later group are rejected
    #[test]
    fn misordered_dependencies_are_rejected(
        (flow, step, dependency) in misordered_flow_strategy()
    ) {
        let catalog = common::catalog();
        let result = WorkflowGraphBuilder::new(catalog.as_ref())
            .build(&flow, &Dimension::default(), &BTreeMap::new());

        prop_assert_eq!(
            result.unwrap_err(),
            InvalidFlowError::DependencyNotInEarlierGroup { step, dependency }
        );
    }

    /// Property: the aggregate phase depends only on the step phases, not their order
    #[test]
    fn aggregate_phase_is_pure(steps in steps_strategy()) {
        let phase = aggregate_phase(&steps);
        prop_assert_eq!(phase, aggregate_phase(&steps));

        let mut reversed = steps.clone();
        reversed.reverse();
        prop_assert_eq!(phase, aggregate_phase(&reversed));
    }

    /// Property: a settled aggregate never coexists with unfinished steps
    #[test]
    fn aggregate_phase_settles_only_when_steps_are_terminal(steps in steps_strategy()) {
        let phase = aggregate_phase(&steps);
        if phase.is_terminal() {
            prop_assert!(steps.iter().all(|step| step.phase.is_terminal()));
        }
        if steps.iter().any(|step| step.phase.is_failure()) && phase.is_terminal() {
            prop_assert_eq!(phase, TestrunPhase::Failed);
        }
    }

    /// Property: once terminal, a step never changes phase again
    #[test]
    fn terminal_phases_never_regress(
        events in prop::collection::vec(step_phase_strategy(), 1..12),
        cancel_requested in any::<bool>(),
    ) {
        let mut step = Step::new("a", "e2e");
        let context = GuardContext { cancel_requested };
        let mut settled: Option<StepPhase> = None;

        for phase in events {
            let event = StepPhaseEvent::new("tm-prop", "a", phase);
            let _ = StepStateMachine::new(&mut step, context).transition(&event);
            if let Some(settled) = settled {
                prop_assert_eq!(step.phase, settled);
            } else if step.phase.is_terminal() {
                settled = Some(step.phase);
            }
        }
    }

    /// Property: patch versions are cut off, major and minor kept
    #[test]
    fn k8s_versions_truncate_to_major_minor((major, minor, patch) in k8s_version_strategy()) {
        let version = match patch {
            Some(patch) => format!("{major}.{minor}.{patch}"),
            None => format!("{major}.{minor}"),
        };
        prop_assert_eq!(k8s_major_minor_version(&version), Some(format!("{major}.{minor}")));
    }

    /// Property: a page never yields more than its range and keeps the order
    #[test]
    fn pages_stay_within_their_range(len in 0usize..30, from in 0usize..35, span in 0usize..10) {
        let items: Vec<usize> = (0..len).collect();
        let page = Page::new(from, from + span).unwrap();
        let selected = page.apply(items);

        prop_assert!(selected.len() <= span);
        prop_assert!(selected.windows(2).all(|pair| pair[0] + 1 == pair[1]));
        if let Some(first) = selected.first() {
            prop_assert_eq!(*first, from);
        }
    }
}
