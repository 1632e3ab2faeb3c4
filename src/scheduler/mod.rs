//! Scheduler: runs a phase's tasks in parallel where dependencies allow.

mod executor;
mod state;

pub use executor::{DEFAULT_MAX_CONCURRENCY, MAX_CONCURRENCY_CEILING, PhaseExecutor};
pub use state::{PhaseResult, ProgressEvent};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelSignal, cancel_pair};
    use crate::checkpoint::{Checkpoint, CheckpointStore, Checkpointer, MemoryCheckpointStore, Recovered};
    use crate::errors::StoreError;
    use crate::dispatch::{DispatchConfig, Dispatcher, WorkRequest, Worker, WorkerError, WorkerRegistry};
    use crate::graph::TaskGraph;
    use crate::model::{
        AttemptToken, Phase, PhaseId, PhaseKind, Run, RunEvent, RunId, Task, TaskId, TaskStatus,
    };
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records calls and concurrency; fails tasks listed in `fail`.
    #[derive(Default)]
    struct Recorder {
        fail: Vec<&'static str>,
        delay_ms: u64,
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<(String, String)>>,
        contexts: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl Worker for Recorder {
        async fn execute(&self, request: WorkRequest) -> Result<Value, WorkerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((request.task.to_string(), request.token.to_string()));
            self.contexts.lock().unwrap().insert(
                request.task.to_string(),
                request.context.keys().map(|k| k.to_string()).collect(),
            );
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.fail.contains(&request.task.as_str()) {
                Err(WorkerError::Permanent("broken".into()))
            } else {
                Ok(json!({"task": request.task}))
            }
        }
    }

    fn active_run(tasks: Vec<Task>) -> Run {
        let phases = vec![Phase::new("impl", PhaseKind::Implementation, 0)];
        let graph = TaskGraph::from_tasks(vec![PhaseId::new("impl")], tasks).unwrap();
        let mut run = Run::new(RunId::new("run-1"), "", phases, graph);
        run.apply(&RunEvent::PhaseActivated {
            phase: PhaseId::new("impl"),
            at: Utc::now(),
        })
        .unwrap();
        run
    }

    fn executor(worker: Arc<Recorder>, max: usize) -> PhaseExecutor {
        let config = DispatchConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(WorkerRegistry::new().with_fallback(worker), config);
        PhaseExecutor::new(Arc::new(dispatcher), max)
    }

    fn checkpointer(store: Arc<MemoryCheckpointStore>) -> Checkpointer {
        Checkpointer::new(store, RunId::new("run-1"), 8, RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_phase_runs_all_tasks_respecting_dependencies() {
        let worker = Arc::new(Recorder::default());
        let mut run = active_run(vec![
            Task::new("A", "impl", "coder"),
            Task::new("B", "impl", "coder"),
            Task::new("C", "impl", "coder").with_depends_on(["A", "B"]),
        ]);
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut cp = checkpointer(store);

        let result = executor(worker.clone(), 4)
            .run_phase(&mut run, &mut cp, &PhaseId::new("impl"), &CancelSignal::never())
            .await
            .unwrap();

        assert!(result.all_succeeded());
        assert_eq!(result.counts.succeeded, 3);
        let calls = worker.calls.lock().unwrap();
        assert_eq!(calls.last().unwrap().0, "C");
        let mut ctx = worker.contexts.lock().unwrap()["C"].clone();
        ctx.sort();
        assert_eq!(ctx, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_concurrency_bound_and_insertion_order() {
        let worker = Arc::new(Recorder {
            delay_ms: 20,
            ..Default::default()
        });
        let tasks = (0..6).map(|i| Task::new(format!("t{}", i), "impl", "coder")).collect();
        let mut run = active_run(tasks);
        let mut cp = checkpointer(Arc::new(MemoryCheckpointStore::new()));

        executor(worker.clone(), 2)
            .run_phase(&mut run, &mut cp, &PhaseId::new("impl"), &CancelSignal::never())
            .await
            .unwrap();

        assert!(worker.peak.load(Ordering::SeqCst) <= 2);
        let calls = worker.calls.lock().unwrap();
        let first_two: Vec<&str> = calls.iter().take(2).map(|c| c.0.as_str()).collect();
        assert!(first_two.contains(&"t0") && first_two.contains(&"t1"));
    }

    #[tokio::test]
    async fn test_failed_task_skips_dependents_without_dispatch() {
        let worker = Arc::new(Recorder {
            fail: vec!["E"],
            ..Default::default()
        });
        let mut run = active_run(vec![
            Task::new("E", "impl", "coder"),
            Task::new("D", "impl", "coder").with_depends_on(["E"]),
        ]);
        let mut cp = checkpointer(Arc::new(MemoryCheckpointStore::new()));
        let (tx, mut rx) = mpsc::channel(64);

        let result = executor(worker.clone(), 4)
            .with_event_channel(tx)
            .run_phase(&mut run, &mut cp, &PhaseId::new("impl"), &CancelSignal::never())
            .await
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.failed, vec![TaskId::new("E")]);
        assert_eq!(result.skipped, vec![TaskId::new("D")]);
        assert_eq!(worker.calls.lock().unwrap().len(), 1);

        let mut saw_skip = false;
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::TasksSkipped { tasks } = event {
                assert_eq!(tasks, vec![TaskId::new("D")]);
                saw_skip = true;
            }
        }
        assert!(saw_skip);
    }

    #[tokio::test]
    async fn test_recovered_running_task_redispatched_with_same_token() {
        let worker = Arc::new(Recorder::default());
        let mut run = active_run(vec![Task::new("A", "impl", "coder")]);
        run.apply(&RunEvent::TaskStarted {
            task: TaskId::new("A"),
            at: Utc::now(),
        })
        .unwrap();
        let mut cp = checkpointer(Arc::new(MemoryCheckpointStore::new()));

        executor(worker.clone(), 4)
            .run_phase(&mut run, &mut cp, &PhaseId::new("impl"), &CancelSignal::never())
            .await
            .unwrap();

        let calls = worker.calls.lock().unwrap();
        let expected = AttemptToken::new(&RunId::new("run-1"), &TaskId::new("A"), 1, 1);
        assert_eq!(calls.as_slice(), &[("A".to_string(), expected.to_string())]);
        assert_eq!(
            run.graph.get(&TaskId::new("A")).unwrap().status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_empty_phase_completes_immediately() {
        let worker = Arc::new(Recorder::default());
        let mut run = active_run(vec![]);
        let mut cp = checkpointer(Arc::new(MemoryCheckpointStore::new()));
        let result = executor(worker, 4)
            .run_phase(&mut run, &mut cp, &PhaseId::new("impl"), &CancelSignal::never())
            .await
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(result.counts.total(), 0);
    }

    #[tokio::test]
    async fn test_cancel_leaves_in_flight_tasks_running() {
        let worker = Arc::new(Recorder {
            delay_ms: 10_000,
            ..Default::default()
        });
        let mut run = active_run(vec![Task::new("A", "impl", "coder")]);
        let mut cp = checkpointer(Arc::new(MemoryCheckpointStore::new()));
        let (handle, signal) = cancel_pair();

        let exec = PhaseExecutor::new(
            Arc::new(Dispatcher::new(
                WorkerRegistry::new().with_fallback(worker),
                DispatchConfig {
                    retry: RetryPolicy::none(),
                    cancel_grace: Duration::from_millis(10),
                    ..Default::default()
                },
            )),
            4,
        );
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            exec.run_phase(&mut run, &mut cp, &PhaseId::new("impl"), &signal),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.counts.running, 1);
    }

    #[tokio::test]
    async fn test_every_completion_is_checkpointed() {
        let worker = Arc::new(Recorder::default());
        let mut run = active_run(vec![
            Task::new("A", "impl", "coder"),
            Task::new("B", "impl", "coder").with_depends_on(["A"]),
        ]);
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut cp = checkpointer(store.clone());
        cp.snapshot(&run).await.unwrap();

        executor(worker, 4)
            .run_phase(&mut run, &mut cp, &PhaseId::new("impl"), &CancelSignal::never())
            .await
            .unwrap();

        let (replayed, _) = store
            .load(&RunId::new("run-1"))
            .await
            .unwrap()
            .unwrap()
            .replay()
            .unwrap();
        assert_eq!(replayed, run);
    }

    /// Memory store whose writes fail once `broken` is set.
    struct BreakableStore {
        inner: MemoryCheckpointStore,
        broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CheckpointStore for BreakableStore {
        async fn save(&self, run: &RunId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk gone".into()));
            }
            self.inner.save(run, checkpoint).await
        }

        async fn load(&self, run: &RunId) -> Result<Option<Recovered>, StoreError> {
            self.inner.load(run).await
        }

        async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
            self.inner.list_runs().await
        }
    }

    /// Sets `flag` when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// `fast` breaks the store and returns; anything else sleeps for a minute.
    struct StoreBreaker {
        broken: Arc<AtomicBool>,
        slow_dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Worker for StoreBreaker {
        async fn execute(&self, request: WorkRequest) -> Result<Value, WorkerError> {
            if request.task.as_str() == "fast" {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.broken.store(true, Ordering::SeqCst);
                return Ok(json!({}));
            }
            let _guard = DropFlag(self.slow_dropped.clone());
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_checkpoint_failure_aborts_in_flight_dispatches() {
        let broken = Arc::new(AtomicBool::new(false));
        let slow_dropped = Arc::new(AtomicBool::new(false));
        let worker = Arc::new(StoreBreaker {
            broken: broken.clone(),
            slow_dropped: slow_dropped.clone(),
        });
        let config = DispatchConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(WorkerRegistry::new().with_fallback(worker), config);
        let executor = PhaseExecutor::new(Arc::new(dispatcher), 4);

        let mut run = active_run(vec![
            Task::new("fast", "impl", "coder"),
            Task::new("slow", "impl", "coder"),
        ]);
        let store = Arc::new(BreakableStore {
            inner: MemoryCheckpointStore::new(),
            broken,
        });
        let mut cp = Checkpointer::new(store, RunId::new("run-1"), 8, RetryPolicy::none());

        let result = executor
            .run_phase(&mut run, &mut cp, &PhaseId::new("impl"), &CancelSignal::never())
            .await;
        assert!(result.is_err());

        for _ in 0..100 {
            if slow_dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(slow_dropped.load(Ordering::SeqCst));
    }
}
