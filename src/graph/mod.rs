//! Task graph with dependency-aware readiness and skip cascades.
//!
//! The graph owns every task of a run. It answers which tasks can run next,
//! enforces the task transition table, propagates failures to dependents and
//! resets tasks for revision.

mod task_graph;

pub use task_graph::{StatusCounts, TaskGraph};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GraphError;
    use crate::model::{PhaseId, SkipReason, Task, TaskId, TaskStatus, TaskUpdate};
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn graph_with(tasks: Vec<Task>) -> TaskGraph {
        TaskGraph::from_tasks(vec![PhaseId::new("plan"), PhaseId::new("impl")], tasks).unwrap()
    }

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|t| t.id.to_string()).collect()
    }

    fn succeed(graph: &mut TaskGraph, id: &str) {
        let id = TaskId::new(id);
        graph
            .mark_status(&id, TaskStatus::Running, TaskUpdate::default(), Utc::now())
            .unwrap();
        graph
            .mark_status(
                &id,
                TaskStatus::Succeeded,
                TaskUpdate::succeeded(serde_json::json!({}), 1),
                Utc::now(),
            )
            .unwrap();
    }

    fn fail(graph: &mut TaskGraph, id: &str) -> Vec<TaskId> {
        let id = TaskId::new(id);
        graph
            .mark_status(&id, TaskStatus::Running, TaskUpdate::default(), Utc::now())
            .unwrap();
        graph
            .mark_status(&id, TaskStatus::Failed, TaskUpdate::failed("boom", 3), Utc::now())
            .unwrap()
    }

    #[test]
    fn test_add_task_rejects_unknown_prerequisite() {
        let mut graph = TaskGraph::new();
        graph.add_phase("impl");
        let err = graph
            .add_task(Task::new("A", "impl", "coder").with_depends_on(["ghost"]))
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownPrerequisite { .. }));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_add_task_rejects_duplicate_and_self_dependency() {
        let mut graph = TaskGraph::new();
        graph.add_phase("impl");
        graph.add_task(Task::new("A", "impl", "coder")).unwrap();
        assert!(matches!(
            graph.add_task(Task::new("A", "impl", "coder")),
            Err(GraphError::DuplicateTask { .. })
        ));
        assert!(matches!(
            graph.add_task(Task::new("B", "impl", "coder").with_depends_on(["B"])),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_add_task_rejects_later_phase_prerequisite() {
        let mut graph = TaskGraph::new();
        graph.add_phase("plan");
        graph.add_phase("impl");
        graph.add_task(Task::new("A", "impl", "coder")).unwrap();
        let err = graph
            .add_task(Task::new("P", "plan", "planner").with_depends_on(["A"]))
            .unwrap_err();
        assert!(matches!(err, GraphError::CrossPhaseDependency { .. }));
    }

    #[test]
    fn test_from_tasks_detects_cycle() {
        let result = TaskGraph::from_tasks(
            vec![PhaseId::new("impl")],
            vec![
                Task::new("A", "impl", "coder").with_depends_on(["B"]),
                Task::new("B", "impl", "coder").with_depends_on(["A"]),
                Task::new("C", "impl", "coder"),
            ],
        );
        match result {
            Err(GraphError::Cycle { tasks, .. }) => {
                assert_eq!(tasks, vec![TaskId::new("A"), TaskId::new("B")]);
            }
            other => panic!("Expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_ready_tasks_in_insertion_order() {
        let graph = graph_with(vec![
            Task::new("B", "impl", "coder"),
            Task::new("A", "impl", "coder"),
            Task::new("C", "impl", "coder").with_depends_on(["A", "B"]),
        ]);
        assert_eq!(ids(&graph.ready_tasks(&PhaseId::new("impl"))), vec!["B", "A"]);
    }

    #[test]
    fn test_dependent_ready_only_after_all_prerequisites_succeed() {
        let mut graph = graph_with(vec![
            Task::new("A", "impl", "coder"),
            Task::new("B", "impl", "coder"),
            Task::new("C", "impl", "coder").with_depends_on(["A", "B"]),
        ]);
        let phase = PhaseId::new("impl");

        succeed(&mut graph, "A");
        assert_eq!(ids(&graph.ready_tasks(&phase)), vec!["B"]);
        succeed(&mut graph, "B");
        assert_eq!(ids(&graph.ready_tasks(&phase)), vec!["C"]);
    }

    #[test]
    fn test_mark_status_rejects_running_before_prerequisites() {
        let mut graph = graph_with(vec![
            Task::new("A", "impl", "coder"),
            Task::new("B", "impl", "coder").with_depends_on(["A"]),
        ]);
        let err = graph
            .mark_status(&TaskId::new("B"), TaskStatus::Running, TaskUpdate::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));
    }

    #[test]
    fn test_terminal_task_cannot_transition() {
        let mut graph = graph_with(vec![Task::new("A", "impl", "coder")]);
        succeed(&mut graph, "A");
        let err = graph
            .mark_status(&TaskId::new("A"), TaskStatus::Running, TaskUpdate::default(), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::InvalidTransition {
                task: TaskId::new("A"),
                from: TaskStatus::Succeeded,
                to: TaskStatus::Running,
            }
        );
    }

    #[test]
    fn test_failure_cascades_to_transitive_dependents() {
        let mut graph = graph_with(vec![
            Task::new("E", "impl", "coder"),
            Task::new("D", "impl", "coder").with_depends_on(["E"]),
            Task::new("F", "impl", "coder").with_depends_on(["D"]),
            Task::new("G", "impl", "coder"),
        ]);

        let cascade = fail(&mut graph, "E");

        assert_eq!(cascade, vec![TaskId::new("D"), TaskId::new("F")]);
        for id in ["D", "F"] {
            let task = graph.get(&TaskId::new(id)).unwrap();
            assert_eq!(task.status, TaskStatus::Skipped);
            assert_eq!(
                task.skip_reason,
                Some(SkipReason::DependencyFailed {
                    task: TaskId::new("E")
                })
            );
        }
        assert_eq!(graph.get(&TaskId::new("G")).unwrap().status, TaskStatus::Pending);
        assert!(graph.ready_tasks(&PhaseId::new("impl")).iter().all(|t| t.id.as_str() == "G"));
    }

    #[test]
    fn test_cascade_crosses_phases() {
        let mut graph = graph_with(vec![
            Task::new("P", "plan", "planner"),
            Task::new("A", "impl", "coder").with_depends_on(["P"]),
        ]);
        let cascade = fail(&mut graph, "P");
        assert_eq!(cascade, vec![TaskId::new("A")]);
        assert!(graph.phase_complete(&PhaseId::new("impl")));
    }

    #[test]
    fn test_revise_resets_only_targets_and_their_cascade() {
        let mut graph = graph_with(vec![
            Task::new("A", "impl", "coder"),
            Task::new("B", "impl", "coder"),
            Task::new("C", "impl", "coder").with_depends_on(["B"]),
        ]);
        succeed(&mut graph, "A");
        fail(&mut graph, "B");

        let reset = graph.revise(&[TaskId::new("B")], Utc::now()).unwrap();

        assert_eq!(reset, vec![TaskId::new("B"), TaskId::new("C")]);
        let a = graph.get(&TaskId::new("A")).unwrap();
        assert_eq!(a.status, TaskStatus::Succeeded);
        assert_eq!(a.attempt, 1);
        let b = graph.get(&TaskId::new("B")).unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
        assert_eq!(b.attempt, 2);
        assert_eq!(b.history.len(), 1);
        assert_eq!(b.history[0].status, TaskStatus::Failed);
        assert_eq!(graph.get(&TaskId::new("C")).unwrap().status, TaskStatus::Pending);
        assert_eq!(ids(&graph.ready_tasks(&PhaseId::new("impl"))), vec!["B"]);
    }

    #[test]
    fn test_revise_rejects_non_terminal_task() {
        let mut graph = graph_with(vec![Task::new("A", "impl", "coder")]);
        let err = graph.revise(&[TaskId::new("A")], Utc::now()).unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));
    }

    #[test]
    fn test_revise_resettles_task_with_other_failed_prerequisite() {
        let mut graph = graph_with(vec![
            Task::new("A", "impl", "coder"),
            Task::new("B", "impl", "coder"),
            Task::new("C", "impl", "coder").with_depends_on(["A", "B"]),
        ]);
        fail(&mut graph, "A");
        fail(&mut graph, "B");

        graph.revise(&[TaskId::new("A")], Utc::now()).unwrap();

        // C still has a failed prerequisite (B)
        let c = graph.get(&TaskId::new("C")).unwrap();
        assert_eq!(c.status, TaskStatus::Skipped);
        assert_eq!(
            c.skip_reason,
            Some(SkipReason::DependencyFailed {
                task: TaskId::new("B")
            })
        );
    }

    #[test]
    fn test_status_counts_and_phase_complete() {
        let mut graph = graph_with(vec![
            Task::new("P", "plan", "planner"),
            Task::new("A", "impl", "coder"),
        ]);
        let plan = PhaseId::new("plan");
        assert!(!graph.phase_complete(&plan));
        succeed(&mut graph, "P");
        assert!(graph.phase_complete(&plan));

        let counts = graph.status_counts(None);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 2);
        assert_eq!(graph.status_counts(Some(&plan)).open(), 0);
    }

    #[test]
    fn test_empty_phase_is_complete() {
        let graph = graph_with(vec![Task::new("A", "impl", "coder")]);
        assert!(graph.phase_complete(&PhaseId::new("plan")));
        assert!(graph.ready_tasks(&PhaseId::new("plan")).is_empty());
    }

    #[test]
    fn test_graph_serde_rebuilds_indices() {
        let mut graph = graph_with(vec![
            Task::new("A", "impl", "coder"),
            Task::new("B", "impl", "coder").with_depends_on(["A"]),
        ]);
        succeed(&mut graph, "A");

        let json = serde_json::to_string(&graph).unwrap();
        let restored: TaskGraph = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, graph);
        assert_eq!(ids(&restored.ready_tasks(&PhaseId::new("impl"))), vec!["B"]);
        assert_eq!(restored.dependents_of(&TaskId::new("A")).len(), 1);
    }

    /// Random DAG over one phase: each task may depend on earlier tasks.
    fn random_graph(rng: &mut StdRng, size: usize) -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph.add_phase("impl");
        for i in 0..size {
            let deps: Vec<String> = (0..i)
                .filter(|_| rng.gen_bool(0.3))
                .map(|j| format!("t{}", j))
                .collect();
            graph
                .add_task(Task::new(format!("t{}", i), "impl", "coder").with_depends_on(deps))
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_randomized_ready_tasks_never_have_unsatisfied_prerequisites() {
        let phase = PhaseId::new("impl");
        for seed in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let size = rng.gen_range(1..25);
            let mut graph = random_graph(&mut rng, size);

            loop {
                let ready: Vec<TaskId> = graph.ready_tasks(&phase).iter().map(|t| t.id.clone()).collect();
                for id in &ready {
                    for prereq in graph.prerequisites_of(id) {
                        assert_eq!(
                            prereq.status,
                            TaskStatus::Succeeded,
                            "seed {}: {} ready with {} {}",
                            seed,
                            id,
                            prereq.id,
                            prereq.status
                        );
                    }
                }
                if ready.is_empty() {
                    break;
                }

                let pick = &ready[rng.gen_range(0..ready.len())];
                if rng.gen_bool(0.2) {
                    fail(&mut graph, pick.as_str());
                } else {
                    succeed(&mut graph, pick.as_str());
                }
            }

            assert!(graph.phase_complete(&phase), "seed {}", seed);
            // failed prerequisite implies skipped dependent
            for task in graph.tasks() {
                if graph
                    .prerequisites_of(&task.id)
                    .iter()
                    .any(|p| matches!(p.status, TaskStatus::Failed | TaskStatus::Skipped))
                {
                    assert_eq!(task.status, TaskStatus::Skipped, "seed {}: {}", seed, task.id);
                }
            }
        }
    }
}
