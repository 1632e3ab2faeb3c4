//! Control surface: start, inspect, cancel and resume runs.
//!
//! A `Conductor` owns the checkpoint store and worker dispatcher and runs
//! each started run on its own tokio task. Everything it reports is read
//! back from the checkpoint log, so runs started by another process (or
//! before a crash) are visible too.

use crate::cancel::{CancelHandle, CancelSignal, cancel_pair};
use crate::checkpoint::{CheckpointStore, Checkpointer};
use crate::controller::RunController;
use crate::dispatch::Dispatcher;
use crate::errors::RunError;
use crate::gates::GateEvaluator;
use crate::model::{PhaseId, Run, RunEvent, RunFailure, RunId, RunSpec, RunState, SpecRules};
use crate::report::RunReport;
use crate::retry::RetryPolicy;
use crate::scheduler::{DEFAULT_MAX_CONCURRENCY, ProgressEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info};

/// Tunables for runs started by a [`Conductor`].
#[derive(Debug, Clone)]
pub struct ConductorOptions {
    pub max_concurrency: usize,
    pub snapshot_every: u32,
    pub checkpoint_retry: RetryPolicy,
    pub spec_rules: SpecRules,
}

impl Default for ConductorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            snapshot_every: 8,
            checkpoint_retry: RetryPolicy::default(),
            spec_rules: SpecRules::default(),
        }
    }
}

/// What `status` reports about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub id: RunId,
    pub title: String,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseId>,
    /// Being driven by this process
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub report: RunReport,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunStatusView {
    fn new(run: &Run, active: bool) -> Self {
        Self {
            id: run.id.clone(),
            title: run.title.clone(),
            state: run.state,
            current_phase: run.current().map(|p| p.id.clone()),
            active,
            failure: run.failure.clone(),
            report: RunReport::from_run(run),
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

/// A run driven by this process.
struct ActiveRun {
    cancel: CancelHandle,
    /// Final state of the run once its task ends
    done: watch::Receiver<Option<Run>>,
}

impl ActiveRun {
    fn finished(&self) -> Option<Run> {
        self.done.borrow().clone()
    }

    fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }
}

/// Driver half of a reserved run slot, handed to `launch`.
struct Reservation {
    signal: CancelSignal,
    done: watch::Sender<Option<Run>>,
}

pub struct Conductor {
    store: Arc<dyn CheckpointStore>,
    dispatcher: Arc<Dispatcher>,
    gates: GateEvaluator,
    options: ConductorOptions,
    event_tx: Option<mpsc::Sender<ProgressEvent>>,
    runs: Mutex<HashMap<RunId, ActiveRun>>,
}

impl Conductor {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        dispatcher: Arc<Dispatcher>,
        gates: GateEvaluator,
        options: ConductorOptions,
    ) -> Self {
        Self {
            store,
            dispatcher,
            gates,
            options,
            event_tx: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Send progress events of every run to `tx`.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Validate `spec`, persist the new run and start driving it.
    pub async fn start(&self, spec: &RunSpec) -> Result<RunId, RunError> {
        let run = spec.build_run(RunId::generate(), &self.options.spec_rules)?;
        let reservation = self.reserve(&run.id).await?;
        let mut checkpointer = self.checkpointer(&run.id);
        if let Err(e) = checkpointer.snapshot(&run).await {
            self.release(&run.id).await;
            return Err(e);
        }

        info!(
            run_id = %run.id,
            phases = run.phases.len(),
            tasks = run.graph.len(),
            "Run created"
        );
        let id = run.id.clone();
        self.launch(run, checkpointer, reservation);
        Ok(id)
    }

    /// Continue a run from its checkpoint log.
    pub async fn resume(&self, id: &RunId) -> Result<(), RunError> {
        let reservation = self.reserve(id).await?;
        let (run, last_seq) = match self.load(id).await {
            Ok((run, _)) if run.state.is_terminal() => {
                self.release(id).await;
                return Err(RunError::Terminal {
                    run: id.clone(),
                    state: run.state,
                });
            }
            Ok(loaded) => loaded,
            Err(e) => {
                self.release(id).await;
                return Err(e);
            }
        };

        info!(run_id = %id, state = %run.state, last_seq, "Resuming run");
        let checkpointer = self.checkpointer(id).resume_after(last_seq);
        self.launch(run, checkpointer, reservation);
        Ok(())
    }

    /// Current state of a run.
    pub async fn status(&self, id: &RunId) -> Result<RunStatusView, RunError> {
        let running = {
            let mut runs = self.runs.lock().await;
            match runs.get(id).map(|active| active.finished()) {
                Some(Some(run)) => {
                    runs.remove(id);
                    return Ok(RunStatusView::new(&run, false));
                }
                Some(None) => true,
                None => false,
            }
        };
        let (run, _) = self.load(id).await?;
        Ok(RunStatusView::new(&run, running))
    }

    /// Request cancellation.
    ///
    /// A run driven here aborts once its in-flight dispatches return. A run
    /// that nobody is driving is aborted directly in its checkpoint log.
    pub async fn cancel(&self, id: &RunId) -> Result<(), RunError> {
        {
            let runs = self.runs.lock().await;
            if let Some(active) = runs.get(id)
                && !active.is_finished()
            {
                info!(run_id = %id, "Cancellation requested");
                active.cancel.cancel();
                return Ok(());
            }
        }

        let (mut run, last_seq) = self.load(id).await?;
        if run.state.is_terminal() {
            return Err(RunError::Terminal {
                run: id.clone(),
                state: run.state,
            });
        }
        let mut checkpointer = self.checkpointer(id).resume_after(last_seq);
        checkpointer
            .commit(
                &mut run,
                RunEvent::RunAborted {
                    reason: "cancelled while not running".to_string(),
                    at: Utc::now(),
                },
            )
            .await?;
        info!(run_id = %id, "Idle run aborted");
        Ok(())
    }

    /// Wait for a run driven here to finish; other runs report their
    /// current status immediately.
    pub async fn wait(&self, id: &RunId) -> Result<RunStatusView, RunError> {
        let done = {
            let runs = self.runs.lock().await;
            runs.get(id).map(|active| active.done.clone())
        };
        if let Some(mut done) = done {
            let view = done
                .wait_for(|run| run.is_some())
                .await
                .ok()
                .and_then(|finished| finished.as_ref().map(|run| RunStatusView::new(run, false)));
            if let Some(view) = view {
                self.forget_finished(id).await;
                return Ok(view);
            }
        }
        self.status(id).await
    }

    /// Every run in the store, oldest first.
    pub async fn list(&self) -> Result<Vec<RunStatusView>, RunError> {
        let ids = self
            .store
            .list_runs()
            .await
            .map_err(|source| RunError::Infrastructure {
                attempts: 1,
                source,
            })?;
        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            views.push(self.status(&id).await?);
        }
        views.sort_by_key(|v| v.created_at);
        Ok(views)
    }

    /// Claim `id` for a driver. Checking and inserting happen under one lock
    /// so two callers can never both drive the same run.
    async fn reserve(&self, id: &RunId) -> Result<Reservation, RunError> {
        let mut runs = self.runs.lock().await;
        if runs.get(id).is_some_and(|active| !active.is_finished()) {
            return Err(RunError::AlreadyRunning { run: id.clone() });
        }
        let (cancel, signal) = cancel_pair();
        let (done_tx, done_rx) = watch::channel(None);
        runs.insert(
            id.clone(),
            ActiveRun {
                cancel,
                done: done_rx,
            },
        );
        Ok(Reservation {
            signal,
            done: done_tx,
        })
    }

    /// Drop a reservation that never got launched.
    async fn release(&self, id: &RunId) {
        self.runs.lock().await.remove(id);
    }

    /// Drop the entry of a finished run; later queries read the log.
    async fn forget_finished(&self, id: &RunId) {
        let mut runs = self.runs.lock().await;
        if runs.get(id).is_some_and(ActiveRun::is_finished) {
            runs.remove(id);
        }
    }

    async fn load(&self, id: &RunId) -> Result<(Run, u64), RunError> {
        let recovered = self
            .store
            .load(id)
            .await
            .map_err(|source| RunError::Infrastructure {
                attempts: 1,
                source,
            })?
            .ok_or_else(|| RunError::UnknownRun { run: id.clone() })?;
        recovered.replay()
    }

    fn checkpointer(&self, id: &RunId) -> Checkpointer {
        Checkpointer::new(
            self.store.clone(),
            id.clone(),
            self.options.snapshot_every,
            self.options.checkpoint_retry.clone(),
        )
    }

    fn launch(&self, mut run: Run, mut checkpointer: Checkpointer, reservation: Reservation) {
        let mut controller = RunController::new(
            self.dispatcher.clone(),
            self.gates.clone(),
            self.options.max_concurrency,
        );
        if let Some(tx) = &self.event_tx {
            controller = controller.with_event_channel(tx.clone());
        }

        let Reservation { signal, done } = reservation;
        tokio::spawn(async move {
            if let Err(e) = controller.drive(&mut run, &mut checkpointer, &signal).await {
                error!(run_id = %run.id, error = %e, "Run stopped with error");
            }
            done.send_replace(Some(run));
        });
    }
}
