//! Phase executor: runs one phase's tasks to quiescence.
//!
//! The loop is event driven. Ready tasks are dispatched in insertion order up
//! to the concurrency bound; each completion is applied to the run and
//! checkpointed before the next one, so the checkpoint log follows
//! application order rather than arrival order.

use crate::cancel::CancelSignal;
use crate::checkpoint::Checkpointer;
use crate::dispatch::{DispatchReport, Dispatcher, Outcome};
use crate::errors::RunError;
use crate::model::{PhaseId, Run, RunEvent, Task, TaskId, TaskStatus, TaskUpdate};
use crate::scheduler::state::{ExecutionTimer, PhaseResult, ProgressEvent};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Hard ceiling on concurrent dispatches.
pub const MAX_CONCURRENCY_CEILING: usize = 64;

/// Default concurrent dispatches per phase.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// A finished dispatch, or the panic message of its task.
type Completion = (TaskId, Result<DispatchReport, String>);

/// A spawned dispatch: the reporter task and the dispatch it awaits.
struct InFlight {
    reporter: JoinHandle<()>,
    dispatch: AbortHandle,
}

impl InFlight {
    fn abort(&self) {
        self.dispatch.abort();
        self.reporter.abort();
    }
}

pub struct PhaseExecutor {
    dispatcher: Arc<Dispatcher>,
    max_concurrency: usize,
    event_tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl PhaseExecutor {
    /// `max_concurrency` is clamped to `1..=MAX_CONCURRENCY_CEILING`.
    pub fn new(dispatcher: Arc<Dispatcher>, max_concurrency: usize) -> Self {
        Self {
            dispatcher,
            max_concurrency: max_concurrency.clamp(1, MAX_CONCURRENCY_CEILING),
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run the active phase until no task is pending, ready or running.
    ///
    /// Tasks already `running` (recovered after a crash) are dispatched again
    /// with their current attempt. On cancellation, in-flight dispatches are
    /// awaited; those that report `Cancelled` stay `running` for the abort to
    /// sweep up.
    pub async fn run_phase(
        &self,
        run: &mut Run,
        checkpointer: &mut Checkpointer,
        phase: &PhaseId,
        cancel: &CancelSignal,
    ) -> Result<PhaseResult, RunError> {
        let timer = ExecutionTimer::start();
        let mut active: HashMap<TaskId, InFlight> = HashMap::new();
        let cancelled = match self
            .drive_phase(run, checkpointer, phase, cancel, &mut active)
            .await
        {
            Ok(cancelled) => cancelled,
            Err(e) => {
                if !active.is_empty() {
                    warn!(
                        run_id = %run.id,
                        phase = %phase,
                        in_flight = active.len(),
                        error = %e,
                        "Aborting in-flight dispatches"
                    );
                }
                for (_, flight) in active.drain() {
                    flight.abort();
                }
                return Err(e);
            }
        };

        let result = self.phase_result(run, phase, cancelled, timer);
        self.emit(ProgressEvent::PhaseFinished {
            result: Box::new(result.clone()),
        })
        .await;
        Ok(result)
    }

    /// The dispatch loop of `run_phase`. Returns whether it stopped on cancel.
    async fn drive_phase(
        &self,
        run: &mut Run,
        checkpointer: &mut Checkpointer,
        phase: &PhaseId,
        cancel: &CancelSignal,
        active: &mut HashMap<TaskId, InFlight>,
    ) -> Result<bool, RunError> {
        let (result_tx, mut result_rx) = mpsc::channel::<Completion>(MAX_CONCURRENCY_CEILING);
        let mut cancelled = false;

        let recovered: Vec<Task> = run
            .graph
            .tasks_with_status(phase, TaskStatus::Running)
            .into_iter()
            .cloned()
            .collect();
        for task in recovered {
            info!(run_id = %run.id, task = %task.id, attempt = task.attempt, "Re-dispatching recovered task");
            let flight = self.spawn(run, &task, cancel, result_tx.clone());
            active.insert(task.id.clone(), flight);
        }

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let newly_ready: Vec<TaskId> = run
                .graph
                .ready_tasks(phase)
                .iter()
                .map(|t| t.id.clone())
                .collect();
            for task in newly_ready {
                checkpointer
                    .commit(run, RunEvent::TaskReady { task, at: Utc::now() })
                    .await?;
            }

            while active.len() < self.max_concurrency {
                let Some(task) = run
                    .graph
                    .tasks_with_status(phase, TaskStatus::Ready)
                    .first()
                    .map(|t| (*t).clone())
                else {
                    break;
                };
                checkpointer
                    .commit(
                        run,
                        RunEvent::TaskStarted {
                            task: task.id.clone(),
                            at: Utc::now(),
                        },
                    )
                    .await?;
                self.emit(ProgressEvent::TaskDispatched {
                    task: task.id.clone(),
                    attempt: task.attempt,
                })
                .await;
                let flight = self.spawn(run, &task, cancel, result_tx.clone());
                active.insert(task.id.clone(), flight);
            }

            if active.is_empty() {
                break;
            }

            let first = tokio::select! {
                completion = result_rx.recv() => completion,
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            };
            let Some(first) = first else {
                break;
            };

            let mut batch = vec![first];
            while let Ok(next) = result_rx.try_recv() {
                batch.push(next);
            }
            debug!(run_id = %run.id, completions = batch.len(), "Applying completions");
            for completion in batch {
                if let Some(flight) = active.remove(&completion.0) {
                    flight.reporter.await.ok();
                }
                self.apply_completion(run, checkpointer, completion).await?;
            }
        }

        if cancelled {
            info!(run_id = %run.id, phase = %phase, in_flight = active.len(), "Cancelling phase");
            drop(result_tx);
            while !active.is_empty() {
                let Some(completion) = result_rx.recv().await else {
                    break;
                };
                if let Some(flight) = active.remove(&completion.0) {
                    flight.reporter.await.ok();
                }
                self.apply_completion(run, checkpointer, completion).await?;
            }
        }

        Ok(cancelled)
    }

    fn spawn(
        &self,
        run: &Run,
        task: &Task,
        cancel: &CancelSignal,
        result_tx: mpsc::Sender<Completion>,
    ) -> InFlight {
        let context: BTreeMap<TaskId, Value> = run
            .graph
            .prerequisites_of(&task.id)
            .into_iter()
            .filter_map(|p| p.result.clone().map(|r| (p.id.clone(), r)))
            .collect();
        let timeout = self.dispatcher.config().timeout_for(&task.role);
        let dispatcher = self.dispatcher.clone();
        let run_id = run.id.clone();
        let task = task.clone();
        let cancel = cancel.clone();

        let task_id = task.id.clone();
        // Isolate worker panics so the completion is always reported.
        let inner = tokio::spawn(async move {
            dispatcher
                .dispatch(&run_id, &task, timeout, context, &cancel)
                .await
        });
        let dispatch = inner.abort_handle();
        let reporter = tokio::spawn(async move {
            let report = inner.await.map_err(|e| e.to_string());
            result_tx.send((task_id, report)).await.ok();
        });
        InFlight { reporter, dispatch }
    }

    async fn apply_completion(
        &self,
        run: &mut Run,
        checkpointer: &mut Checkpointer,
        (task, report): Completion,
    ) -> Result<(), RunError> {
        let (status, update) = match report {
            Ok(report) => {
                let tries = report.try_count();
                match report.outcome {
                    Outcome::Success { result } => {
                        (TaskStatus::Succeeded, TaskUpdate::succeeded(result, tries))
                    }
                    Outcome::Failure { kind, message } => (
                        TaskStatus::Failed,
                        TaskUpdate::failed(format!("{}: {}", kind, message), tries),
                    ),
                    Outcome::Timeout => (TaskStatus::Failed, TaskUpdate::failed("timeout", tries)),
                    Outcome::Cancelled => {
                        debug!(run_id = %run.id, task = %task, "Dispatch cancelled");
                        return Ok(());
                    }
                }
            }
            Err(panic) => {
                error!(run_id = %run.id, task = %task, error = %panic, "Dispatch task panicked");
                (TaskStatus::Failed, TaskUpdate::failed(format!("worker panicked: {}", panic), 0))
            }
        };

        let tries = update.tries.unwrap_or(0);
        match status {
            TaskStatus::Succeeded => info!(run_id = %run.id, task = %task, tries, "Task succeeded"),
            _ => warn!(
                run_id = %run.id,
                task = %task,
                tries,
                error = update.error.as_deref().unwrap_or(""),
                "Task failed"
            ),
        }

        let applied = checkpointer
            .commit(
                run,
                RunEvent::TaskFinished {
                    task: task.clone(),
                    status,
                    update,
                    at: Utc::now(),
                },
            )
            .await?;

        self.emit(ProgressEvent::TaskFinished { task, status, tries })
            .await;
        if !applied.skipped.is_empty() {
            info!(run_id = %run.id, skipped = ?applied.skipped, "Skipped dependents of failed task");
            self.emit(ProgressEvent::TasksSkipped {
                tasks: applied.skipped,
            })
            .await;
        }
        Ok(())
    }

    fn phase_result(&self, run: &Run, phase: &PhaseId, cancelled: bool, timer: ExecutionTimer) -> PhaseResult {
        let ids = |status| {
            run.graph
                .tasks_with_status(phase, status)
                .iter()
                .map(|t| t.id.clone())
                .collect()
        };
        PhaseResult {
            phase: phase.clone(),
            counts: run.graph.status_counts(Some(phase)),
            failed: ids(TaskStatus::Failed),
            skipped: ids(TaskStatus::Skipped),
            cancelled,
            duration: timer.elapsed(),
        }
    }

    /// Emit an event to the event channel if configured.
    pub(crate) async fn emit(&self, event: ProgressEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
