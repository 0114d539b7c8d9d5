//! Dependency graph validation
//!
//! Builds an index-based adjacency list over the step arena and runs a
//! topological sort. Unknown dependency ids and cycles are rejected here,
//! before any step executes. Indices, not object references, keep the
//! representation acyclic-safe and serializable.

use crate::workflow::types::Step;
use sdk::errors::OrchestratorError;
use std::collections::HashMap;

/// Validated view of a workflow's dependency structure
#[derive(Debug)]
pub struct StepGraph {
    /// For each step index, the indices of its dependencies, in declared order
    deps: Vec<Vec<usize>>,

    /// For each step index, the indices of steps depending on it
    dependents: Vec<Vec<usize>>,

    /// A topological order over step indices
    topo_order: Vec<usize>,
}

impl StepGraph {
    /// Build and validate the graph for a step arena.
    ///
    /// Fails with `InvalidTask` on an unknown or self-referential
    /// dependency id, and with `CyclicWorkflow` when the graph contains a
    /// cycle.
    pub fn build(steps: &[Step]) -> Result<Self, OrchestratorError> {
        let index_by_id: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        if index_by_id.len() != steps.len() {
            return Err(OrchestratorError::InvalidTask(
                "Duplicate step ids in workflow".to_string(),
            ));
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

        for (i, step) in steps.iter().enumerate() {
            for dep_id in &step.dependencies {
                let dep_index = *index_by_id.get(dep_id.as_str()).ok_or_else(|| {
                    OrchestratorError::InvalidTask(format!(
                        "Step {} depends on unknown step {}",
                        step.id, dep_id
                    ))
                })?;
                if dep_index == i {
                    return Err(OrchestratorError::CyclicWorkflow {
                        step_id: step.id.clone(),
                    });
                }
                deps[i].push(dep_index);
                dependents[dep_index].push(i);
            }
        }

        let topo_order = topological_sort(steps, &deps, &dependents)?;

        Ok(Self {
            deps,
            dependents,
            topo_order,
        })
    }

    /// Dependency indices of one step, in declared order
    pub fn deps_of(&self, index: usize) -> &[usize] {
        &self.deps[index]
    }

    /// Indices of steps depending on one step
    pub fn dependents_of(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// A topological order over step indices
    pub fn topo_order(&self) -> &[usize] {
        &self.topo_order
    }
}

/// Kahn's algorithm over the index adjacency lists
fn topological_sort(
    steps: &[Step],
    deps: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>, OrchestratorError> {
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut ready: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(index) = ready.pop() {
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != steps.len() {
        // Any step with remaining in-degree sits on or behind a cycle;
        // name the first one in declared order for the error
        let on_cycle = in_degree
            .iter()
            .position(|d| *d > 0)
            .unwrap_or(0);
        return Err(OrchestratorError::CyclicWorkflow {
            step_id: steps[on_cycle].id.clone(),
        });
    }

    Ok(order)
}
