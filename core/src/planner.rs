//! DAG planner: validation and topological layering of Saga steps.
//!
//! # Algorithm
//!
//! 1. Every dependency id must resolve to a declared step.
//! 2. Cycles are detected with a depth-first traversal that keeps a recursion
//!    stack; reaching a node that is still on the stack is a cycle.
//! 3. Layer `k` holds every step whose dependencies all sit in layers `0..k`.
//!    Steps without dependencies form layer 0.
//!
//! Planning is pure and deterministic: within a layer, steps keep their
//! declaration order. The engine is free to run a layer's steps concurrently.
//!
//! ```text
//!  reserve ──┐
//!            ├──► ship        layers: [reserve, charge] [ship]
//!  charge  ──┘
//! ```

use crate::definition::StepDefinition;
use crate::error::DefinitionError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Topological layering of a Saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    layers: Vec<Vec<String>>,
    layer_of: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Layers in execution order.
    #[must_use]
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Layer index of a step.
    #[must_use]
    pub fn layer_of(&self, step_id: &str) -> Option<usize> {
        self.layer_of.get(step_id).copied()
    }

    /// Total number of planned steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.layer_of.len()
    }

    /// Step ids in reverse topological order: later layers first, and within a
    /// layer reverse declaration order.
    #[must_use]
    pub fn reverse_order(&self) -> Vec<&str> {
        self.layers
            .iter()
            .rev()
            .flat_map(|layer| layer.iter().rev().map(String::as_str))
            .collect()
    }
}

/// Stateless planner for Saga definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DagPlanner;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

impl DagPlanner {
    /// Validate the step graph and compute its layers.
    ///
    /// # Errors
    ///
    /// - [`DefinitionError::Empty`] when there are no steps
    /// - [`DefinitionError::DuplicateId`] when two steps share an id
    /// - [`DefinitionError::UnknownDependency`] for a dangling dependency
    /// - [`DefinitionError::CycleDetected`] when the graph is not acyclic
    pub fn plan(definition: &str, steps: &[StepDefinition]) -> Result<ExecutionPlan, DefinitionError> {
        if steps.is_empty() {
            return Err(DefinitionError::Empty {
                definition: definition.to_string(),
            });
        }

        let mut index: HashMap<&str, &StepDefinition> = HashMap::with_capacity(steps.len());
        for step in steps {
            if index.insert(step.id(), step).is_some() {
                return Err(DefinitionError::DuplicateId {
                    definition: definition.to_string(),
                    id: step.id().to_string(),
                });
            }
        }

        for step in steps {
            for dependency in step.dependencies() {
                if !index.contains_key(dependency.as_str()) {
                    return Err(DefinitionError::UnknownDependency {
                        step: step.id().to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(steps.len());
        let mut stack: Vec<&str> = Vec::new();
        for step in steps {
            if !marks.contains_key(step.id()) {
                Self::visit(step.id(), &index, &mut marks, &mut stack)?;
            }
        }

        Ok(Self::layer(steps))
    }

    fn visit<'a>(
        node: &'a str,
        index: &HashMap<&'a str, &'a StepDefinition>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), DefinitionError> {
        marks.insert(node, Mark::OnStack);
        stack.push(node);

        if let Some(step) = index.get(node).copied() {
            for dependency in step.dependencies() {
                let dependency = dependency.as_str();
                match marks.get(dependency).copied() {
                    Some(Mark::OnStack) => {
                        let start = stack.iter().position(|id| *id == dependency).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|id| (*id).to_string()).collect();
                        path.push(dependency.to_string());
                        return Err(DefinitionError::CycleDetected { path });
                    }
                    Some(Mark::Done) => {}
                    None => Self::visit(dependency, index, marks, stack)?,
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    /// Assign layers to an acyclic graph, preserving declaration order.
    fn layer(steps: &[StepDefinition]) -> ExecutionPlan {
        let mut layer_of: HashMap<String, usize> = HashMap::with_capacity(steps.len());
        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut placed: HashSet<&str> = HashSet::with_capacity(steps.len());

        while placed.len() < steps.len() {
            let ready: Vec<&StepDefinition> = steps
                .iter()
                .filter(|step| !placed.contains(step.id()))
                .filter(|step| step.dependencies().iter().all(|dep| placed.contains(dep.as_str())))
                .collect();

            if ready.is_empty() {
                // Unreachable for validated graphs; avoids looping forever otherwise.
                break;
            }

            let layer_index = layers.len();
            let ids: Vec<&str> = ready.into_iter().map(StepDefinition::id).collect();
            for id in &ids {
                layer_of.insert((*id).to_string(), layer_index);
            }
            layers.push(ids.iter().map(|id| (*id).to_string()).collect());
            placed.extend(ids);
        }

        ExecutionPlan { layers, layer_of }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StepOutput;
    use crate::handler::step_fn;

    fn step(id: &str, deps: &[&str]) -> StepDefinition {
        let mut def = StepDefinition::new(id, step_fn(|_| async { Ok(StepOutput::empty()) }));
        for dep in deps {
            def = def.depends_on(*dep);
        }
        def
    }

    #[test]
    fn test_roots_form_first_layer() {
        let plan = DagPlanner::plan("t", &[step("a", &[]), step("b", &[]), step("c", &["a", "b"])])
            .unwrap();

        assert_eq!(plan.layers(), &[vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]);
        assert_eq!(plan.layer_of("c"), Some(1));
    }

    #[test]
    fn test_diamond() {
        let plan = DagPlanner::plan(
            "t",
            &[
                step("d", &["b", "c"]),
                step("b", &["a"]),
                step("c", &["a"]),
                step("a", &[]),
            ],
        )
        .unwrap();

        assert_eq!(plan.layers().len(), 3);
        assert_eq!(plan.layers()[1], vec!["b".to_string(), "c".to_string()]);
        assert_eq!(plan.reverse_order(), vec!["d", "c", "b", "a"]);
    }

    #[test]
    fn test_detects_cycle() {
        let err = DagPlanner::plan("t", &[step("a", &["c"]), step("b", &["a"]), step("c", &["b"])])
            .unwrap_err();

        match err {
            DefinitionError::CycleDetected { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("Expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DagPlanner::plan("t", &[step("a", &["a"])]).unwrap_err();
        assert!(matches!(err, DefinitionError::CycleDetected { .. }));
    }

    #[test]
    fn test_dangling_dependency() {
        let err = DagPlanner::plan("t", &[step("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_duplicate_ids() {
        let err = DagPlanner::plan("t", &[step("a", &[]), step("a", &[])]).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateId { .. }));
    }

    #[test]
    fn test_empty_definition() {
        assert!(matches!(DagPlanner::plan("t", &[]), Err(DefinitionError::Empty { .. })));
    }
}
