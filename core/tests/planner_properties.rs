//! Property tests for the DAG planner.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use proptest::prelude::*;
use sagaflow_core::context::StepOutput;
use sagaflow_core::definition::StepDefinition;
use sagaflow_core::error::DefinitionError;
use sagaflow_core::handler::step_fn;
use sagaflow_core::planner::DagPlanner;

/// Edges only point from a higher index to a lower one, so the graph is acyclic.
fn acyclic_graph() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..14).prop_flat_map(|n| {
        (0..n)
            .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(3)))
            .collect::<Vec<_>>()
            .prop_map(|mut deps| {
                // Step 0 has no candidates; drop anything generated for it.
                if let Some(first) = deps.first_mut() {
                    first.clear();
                }
                deps
            })
    })
}

fn steps_from(deps: &[Vec<usize>], reverse_declaration: bool) -> Vec<StepDefinition> {
    let mut steps: Vec<StepDefinition> = deps
        .iter()
        .enumerate()
        .map(|(i, ds)| {
            let mut step =
                StepDefinition::new(format!("s{i}"), step_fn(|_| async { Ok(StepOutput::empty()) }));
            for d in ds {
                step = step.depends_on(format!("s{d}"));
            }
            step
        })
        .collect();
    if reverse_declaration {
        steps.reverse();
    }
    steps
}

proptest! {
    #[test]
    fn prop_dependencies_sit_in_earlier_layers(deps in acyclic_graph(), reverse in any::<bool>()) {
        let steps = steps_from(&deps, reverse);
        let plan = DagPlanner::plan("prop", &steps).unwrap();

        prop_assert_eq!(plan.step_count(), steps.len());
        for step in &steps {
            let layer = plan.layer_of(step.id()).unwrap();
            if step.dependencies().is_empty() {
                prop_assert_eq!(layer, 0);
            }
            let deepest = step
                .dependencies()
                .iter()
                .map(|d| plan.layer_of(d).unwrap())
                .max();
            if let Some(deepest) = deepest {
                prop_assert_eq!(layer, deepest + 1);
            }
        }
    }

    #[test]
    fn prop_planning_is_deterministic(deps in acyclic_graph()) {
        let steps = steps_from(&deps, false);
        let first = DagPlanner::plan("prop", &steps).unwrap();
        let second = DagPlanner::plan("prop", &steps).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_back_edge_is_rejected(deps in acyclic_graph()) {
        let edge = deps
            .iter()
            .enumerate()
            .find_map(|(i, ds)| ds.first().map(|d| (i, *d)));
        prop_assume!(edge.is_some());
        let (from, to) = edge.unwrap();

        let mut cyclic = deps.clone();
        cyclic[to].push(from);
        let result = DagPlanner::plan("prop", &steps_from(&cyclic, false));
        let is_cycle = matches!(result, Err(DefinitionError::CycleDetected { .. }));
        prop_assert!(is_cycle);
    }
}
