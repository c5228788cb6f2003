//! Dependency graph checks over tasks.
//!
//! Pure, non-blocking logic: cycle detection and topological ordering used
//! by the queue before persisting dependencies.

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("Dependency cycle detected")]
    CycleDetected,
    #[error("Unknown task referenced: {0}")]
    UnknownTask(Uuid),
}

/// An adjacency view over task dependencies: `edges[t]` = tasks `t` depends on.
#[derive(Debug, Clone, Default)]
pub struct TaskDag {
    edges: HashMap<Uuid, HashSet<Uuid>>,
}

impl TaskDag {
    /// Build from `(task, dependencies)` pairs. Unknown dependency targets
    /// are tolerated here and reported by [`Self::validate`].
    pub fn from_edges(pairs: impl IntoIterator<Item = (Uuid, Vec<Uuid>)>) -> Self {
        let mut edges: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for (id, deps) in pairs {
            edges.entry(id).or_default().extend(deps);
        }
        Self { edges }
    }

    pub fn add_task(&mut self, id: Uuid, deps: impl IntoIterator<Item = Uuid>) {
        self.edges.entry(id).or_default().extend(deps);
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Kahn's algorithm. A complete ordering exists iff the graph is acyclic.
    pub fn topological_order(&self) -> Result<Vec<Uuid>, DagError> {
        let mut in_degree: HashMap<Uuid, usize> = self.edges.keys().map(|&k| (k, 0)).collect();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

        for (&task, deps) in &self.edges {
            for &dep in deps {
                // Edges into tasks outside the set are irrelevant for ordering.
                if self.edges.contains_key(&dep) {
                    *in_degree.entry(task).or_insert(0) += 1;
                    dependents.entry(dep).or_default().push(task);
                }
            }
        }

        let mut queue: VecDeque<Uuid> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(deps) = dependents.get(&id) {
                for &dependent in deps {
                    let degree = in_degree.get_mut(&dependent).expect("dependent tracked");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() == self.edges.len() {
            Ok(order)
        } else {
            Err(DagError::CycleDetected)
        }
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_order().is_err()
    }

    /// Check that adding `task -> deps` keeps the graph acyclic and that
    /// every dependency names a known task.
    pub fn validate_addition(&self, task: Uuid, deps: &[Uuid]) -> Result<(), DagError> {
        for dep in deps {
            if *dep != task && !self.edges.contains_key(dep) {
                return Err(DagError::UnknownTask(*dep));
            }
        }
        let mut candidate = self.clone();
        candidate.add_task(task, deps.iter().copied());
        if candidate.has_cycle() {
            return Err(DagError::CycleDetected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_chain_orders() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let dag = TaskDag::from_edges(vec![(a, vec![]), (b, vec![a]), (c, vec![b])]);
        let order = dag.topological_order().unwrap();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn test_cycle_detected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let dag = TaskDag::from_edges(vec![(a, vec![b]), (b, vec![a])]);
        assert!(dag.has_cycle());
        assert_eq!(dag.topological_order(), Err(DagError::CycleDetected));
    }

    #[test]
    fn test_validate_addition_rejects_back_edge() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut dag = TaskDag::default();
        dag.add_task(a, []);
        dag.add_task(b, [a]);
        // a -> b would close the loop
        assert_eq!(dag.validate_addition(a, &[b]), Err(DagError::CycleDetected));
        // a fresh node depending on both is fine
        assert!(dag.validate_addition(Uuid::new_v4(), &[a, b]).is_ok());
    }

    #[test]
    fn test_validate_addition_rejects_unknown_dep() {
        let dag = TaskDag::default();
        let unknown = Uuid::new_v4();
        assert_eq!(
            dag.validate_addition(Uuid::new_v4(), &[unknown]),
            Err(DagError::UnknownTask(unknown))
        );
    }

    #[test]
    fn test_dependency_on_external_completed_task_ignored_for_ordering() {
        // Tasks may depend on tasks outside the working set (already
        // completed and pruned); those edges must not wedge the sort.
        let a = Uuid::new_v4();
        let external = Uuid::new_v4();
        let dag = TaskDag::from_edges(vec![(a, vec![external])]);
        assert_eq!(dag.topological_order().unwrap(), vec![a]);
    }
}
