//! Property tests for the dependency graph: orderings respect edges and
//! cycles are always caught.

use proptest::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;

use foreman::domain::models::{DagError, TaskDag};

proptest! {
    /// Graphs built with only backward edges (each node depends on earlier
    /// nodes) are acyclic, and every topological order puts dependencies
    /// before dependents.
    #[test]
    fn prop_forward_built_graphs_sort_cleanly(
        size in 1usize..30,
        edge_seed in proptest::collection::vec(0usize..1000, 0..120),
    ) {
        let ids: Vec<Uuid> = (0..size).map(|_| Uuid::new_v4()).collect();
        let mut deps: Vec<(Uuid, Vec<Uuid>)> = ids.iter().map(|&id| (id, Vec::new())).collect();

        for (k, seed) in edge_seed.iter().enumerate() {
            if size < 2 {
                break;
            }
            let to = 1 + (seed + k) % (size - 1); // dependent
            let from = (seed * 7 + k) % to;       // dependency, strictly earlier
            let dep = ids[from];
            if !deps[to].1.contains(&dep) {
                deps[to].1.push(dep);
            }
        }

        let dag = TaskDag::from_edges(deps.clone());
        prop_assert!(!dag.has_cycle());

        let order = dag.topological_order().unwrap();
        prop_assert_eq!(order.len(), size);

        let position: HashMap<Uuid, usize> = order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        for (task, task_deps) in &deps {
            for dep in task_deps {
                prop_assert!(
                    position[dep] < position[task],
                    "dependency {} must precede {}",
                    dep,
                    task
                );
            }
        }
    }

    /// Closing any path back onto itself is always detected, both by the
    /// whole-graph check and by incremental addition validation.
    #[test]
    fn prop_cycles_are_always_detected(chain_len in 2usize..20) {
        let ids: Vec<Uuid> = (0..chain_len).map(|_| Uuid::new_v4()).collect();

        // A simple chain: each node depends on the previous one.
        let mut edges: Vec<(Uuid, Vec<Uuid>)> = Vec::new();
        edges.push((ids[0], Vec::new()));
        for i in 1..chain_len {
            edges.push((ids[i], vec![ids[i - 1]]));
        }

        let dag = TaskDag::from_edges(edges);
        prop_assert!(!dag.has_cycle());

        // The back edge head -> tail closes the loop.
        prop_assert_eq!(
            dag.validate_addition(ids[0], &[ids[chain_len - 1]]),
            Err(DagError::CycleDetected)
        );

        let mut cyclic = dag.clone();
        cyclic.add_task(ids[0], [ids[chain_len - 1]]);
        prop_assert!(cyclic.has_cycle());
        prop_assert!(cyclic.topological_order().is_err());
    }

    /// validate_addition never admits an edge to an unknown task, so no
    /// dangling dependency can be persisted.
    #[test]
    fn prop_unknown_dependencies_rejected(size in 0usize..10) {
        let ids: Vec<Uuid> = (0..size).map(|_| Uuid::new_v4()).collect();
        let dag = TaskDag::from_edges(ids.iter().map(|&id| (id, Vec::new())));

        let ghost = Uuid::new_v4();
        prop_assert_eq!(
            dag.validate_addition(Uuid::new_v4(), &[ghost]),
            Err(DagError::UnknownTask(ghost))
        );
    }
}
