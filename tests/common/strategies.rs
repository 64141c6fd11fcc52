use proptest::prelude::*;
use proptest::strategy::Just;

use testmachinery::flow::{FlowSpec, FlowStep, StepGroup};
use testmachinery::metadata::Step;
use testmachinery::state_machine::StepPhase;

pub fn step_phase_strategy() -> impl Strategy<Value = StepPhase> {
    prop_oneof![
        Just(StepPhase::Pending),
        Just(StepPhase::Running),
        Just(StepPhase::Succeeded),
        Just(StepPhase::Failed),
        Just(StepPhase::Timeout),
        Just(StepPhase::Skipped),
    ]
}

/// Group sizes of a flow, 1 to 5 groups of 1 to 4 steps
pub fn group_sizes_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..=4, 1..=5)
}

/// Flow whose explicit dependencies only point at steps of earlier groups
///
/// Every step uses the `e2e` definition; the seeds pick dependency targets.
pub fn flow_strategy() -> impl Strategy<Value = FlowSpec> {
    group_sizes_strategy()
        .prop_flat_map(|sizes| {
            let total: usize = sizes.iter().sum();
            (
                Just(sizes),
                prop::collection::vec(prop::option::of(any::<prop::sample::Index>()), total),
            )
        })
        .prop_map(|(sizes, seeds)| {
            let mut groups = Vec::with_capacity(sizes.len());
            let mut earlier: Vec<String> = Vec::new();
            let mut seeds = seeds.into_iter();

            for (group_index, size) in sizes.iter().enumerate() {
                let mut steps = Vec::with_capacity(*size);
                for step_index in 0..*size {
                    let mut step = FlowStep::new(format!("g{group_index}s{step_index}"), "e2e");
                    if let Some(Some(seed)) = seeds.next() {
                        if !earlier.is_empty() {
                            step = step.depends_on(seed.get(&earlier).clone());
                        }
                    }
                    steps.push(step);
                }
                earlier.extend(steps.iter().map(|step| step.name.clone()));
                groups.push(StepGroup::new(format!("group-{group_index}"), steps));
            }
            FlowSpec::new(groups)
        })
}

/// Flow where one step explicitly depends on a step of its own or a later group
///
/// Yields the flow with the offending step and dependency names.
pub fn misordered_flow_strategy() -> impl Strategy<Value = (FlowSpec, String, String)> {
    group_sizes_strategy()
        .prop_filter("needs two steps", |sizes| sizes.iter().sum::<usize>() >= 2)
        .prop_flat_map(|sizes| {
            (
                Just(sizes),
                any::<prop::sample::Index>(),
                any::<prop::sample::Index>(),
            )
        })
        .prop_map(|(sizes, target_seed, step_seed)| {
            let positions: Vec<(usize, String)> = sizes
                .iter()
                .enumerate()
                .flat_map(|(group, size)| {
                    (0..*size).map(move |index| (group, format!("g{group}s{index}")))
                })
                .collect();
            let (target_group, target) = target_seed.get(&positions).clone();

            let candidates: Vec<&String> = positions
                .iter()
                .filter(|(group, name)| *group <= target_group && *name != target)
                .map(|(_, name)| name)
                .collect();
            let (step, dependency) = if candidates.is_empty() {
                // target is the only step of the first group; let it point forward
                let others: Vec<&String> = positions
                    .iter()
                    .map(|(_, name)| name)
                    .filter(|name| **name != target)
                    .collect();
                (target.clone(), (*step_seed.get(&others)).clone())
            } else {
                ((*step_seed.get(&candidates)).clone(), target)
            };

            let groups = sizes
                .iter()
                .enumerate()
                .map(|(group, size)| {
                    let steps = (0..*size)
                        .map(|index| {
                            let name = format!("g{group}s{index}");
                            let flow_step = FlowStep::new(name.clone(), "e2e");
                            if name == step {
                                flow_step.depends_on(dependency.clone())
                            } else {
                                flow_step
                            }
                        })
                        .collect();
                    StepGroup::new(format!("group-{group}"), steps)
                })
                .collect();
            (FlowSpec::new(groups), step, dependency)
        })
}

/// Steps with arbitrary phases; every third one is a system step
pub fn steps_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(step_phase_strategy(), 0..8).prop_map(|phases| {
        phases
            .into_iter()
            .enumerate()
            .map(|(index, phase)| {
                let mut step = Step::new(format!("step-{index}"), "e2e");
                step.phase = phase;
                step.system_step = index % 3 == 2;
                step
            })
            .collect()
    })
}

/// Kubernetes versions with major, minor and optional patch parts
pub fn k8s_version_strategy() -> impl Strategy<Value = (u32, u32, Option<u32>)> {
    (1u32..3, 0u32..40, prop::option::of(0u32..20))
}
