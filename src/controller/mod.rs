//! Run controller: the state machine that moves a run through its phases.
//!
//! Each step commits one `RunEvent`, so a run resumed from its checkpoint
//! log picks up at the step it stopped at: an active phase re-enters the
//! executor loop, a gated phase is evaluated again.

use crate::cancel::CancelSignal;
use crate::checkpoint::Checkpointer;
use crate::dispatch::Dispatcher;
use crate::errors::RunError;
use crate::gates::{GateEvaluator, PhaseArtifacts};
use crate::model::{
    FailureCause, GateDecision, GateRecord, PhaseId, PhaseStatus, Run, RunEvent, RunFailure,
    RunState,
};
use crate::scheduler::{PhaseExecutor, ProgressEvent};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct RunController {
    executor: PhaseExecutor,
    gates: GateEvaluator,
    event_tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl RunController {
    pub fn new(dispatcher: Arc<Dispatcher>, gates: GateEvaluator, max_concurrency: usize) -> Self {
        Self {
            executor: PhaseExecutor::new(dispatcher, max_concurrency),
            gates,
            event_tx: None,
        }
    }

    /// Send progress events for the whole run, including task level events.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.executor = self.executor.with_event_channel(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    pub fn gates(&self) -> &GateEvaluator {
        &self.gates
    }

    /// Drive `run` until it reaches a terminal state.
    ///
    /// A checkpoint store that stays unavailable fails the run with cause
    /// `infrastructure`; the failure is recorded if the store recovers in
    /// time and the error is returned either way.
    pub async fn drive(
        &self,
        run: &mut Run,
        checkpointer: &mut Checkpointer,
        cancel: &CancelSignal,
    ) -> Result<RunState, RunError> {
        info!(run_id = %run.id, state = %run.state, "Driving run");

        while !run.state.is_terminal() {
            let step = if cancel.is_cancelled() {
                self.abort(run, checkpointer).await
            } else {
                self.step(run, checkpointer, cancel).await
            };

            if let Err(err) = step {
                if let RunError::Infrastructure { .. } = &err {
                    self.fail_on_infrastructure(run, checkpointer, &err).await;
                }
                return Err(err);
            }
        }

        info!(run_id = %run.id, state = %run.state, "Run finished");
        self.emit(ProgressEvent::RunFinished {
            run: run.id.clone(),
            state: run.state,
        })
        .await;
        Ok(run.state)
    }

    async fn step(
        &self,
        run: &mut Run,
        checkpointer: &mut Checkpointer,
        cancel: &CancelSignal,
    ) -> Result<(), RunError> {
        let current = run.current().map(|p| (p.id.clone(), p.status, p.revision_rounds));

        match (run.state, current) {
            (state, Some((phase, PhaseStatus::Active, round))) if state.is_active() => {
                self.emit(ProgressEvent::PhaseStarted {
                    phase: phase.clone(),
                    round,
                })
                .await;
                let result = self
                    .executor
                    .run_phase(run, checkpointer, &phase, cancel)
                    .await?;
                if result.cancelled {
                    return self.abort(run, checkpointer).await;
                }
                info!(
                    run_id = %run.id,
                    phase = %phase,
                    succeeded = result.counts.succeeded,
                    failed = result.counts.failed,
                    skipped = result.counts.skipped,
                    "Phase tasks settled"
                );
                checkpointer
                    .commit(run, RunEvent::PhaseGated { phase, at: Utc::now() })
                    .await?;
            }
            (state, Some((phase, PhaseStatus::Gated, _))) if state.is_gated() => {
                self.evaluate_gate(run, checkpointer, phase).await?;
            }
            (state, Some((phase, PhaseStatus::Rejected, _))) if state.is_gated() => {
                // Rejected but the failure was never recorded
                let record = run
                    .phase(&phase)
                    .and_then(|p| p.last_gate())
                    .cloned();
                let failure = failure_for_rejection(&phase, record.as_ref());
                self.fail(run, checkpointer, failure).await?;
            }
            _ => {
                let next = run.next_pending_phase().map(|p| p.id.clone());
                match next {
                    Some(phase) => {
                        info!(run_id = %run.id, phase = %phase, "Activating phase");
                        checkpointer
                            .commit(run, RunEvent::PhaseActivated { phase, at: Utc::now() })
                            .await?;
                    }
                    None => {
                        checkpointer
                            .commit(run, RunEvent::RunCompleted { at: Utc::now() })
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn evaluate_gate(
        &self,
        run: &mut Run,
        checkpointer: &mut Checkpointer,
        phase: PhaseId,
    ) -> Result<(), RunError> {
        let artifacts = PhaseArtifacts::collect(&run.graph, &phase);
        let Some(current) = run.phase(&phase) else {
            return Err(RunError::InvalidState {
                from: run.state,
                to: run.state,
            });
        };
        let record = self.gates.evaluate(current, &artifacts);
        let decision = record.decision.clone();

        match &decision {
            GateDecision::Approve => info!(run_id = %run.id, phase = %phase, "Phase approved"),
            GateDecision::Revise { reason, targets } => warn!(
                run_id = %run.id,
                phase = %phase,
                round = record.round + 1,
                targets = ?targets,
                "Phase sent back for revision: {}",
                reason
            ),
            GateDecision::Reject { reason } => {
                error!(run_id = %run.id, phase = %phase, "Phase rejected: {}", reason)
            }
        }

        let failure = decision
            .is_reject()
            .then(|| failure_for_rejection(&phase, Some(&record)));
        let applied = checkpointer
            .commit(
                run,
                RunEvent::GateDecided {
                    phase: phase.clone(),
                    record,
                },
            )
            .await?;
        if !applied.reset.is_empty() {
            info!(run_id = %run.id, reset = ?applied.reset, "Tasks reset for revision");
        }
        self.emit(ProgressEvent::GateDecided { phase, decision }).await;

        if let Some(failure) = failure {
            self.fail(run, checkpointer, failure).await?;
        }
        Ok(())
    }

    async fn fail(
        &self,
        run: &mut Run,
        checkpointer: &mut Checkpointer,
        failure: RunFailure,
    ) -> Result<(), RunError> {
        error!(run_id = %run.id, cause = %failure.cause, "Run failed: {}", failure.reason);
        checkpointer
            .commit(run, RunEvent::RunFailed { failure, at: Utc::now() })
            .await?;
        Ok(())
    }

    async fn abort(&self, run: &mut Run, checkpointer: &mut Checkpointer) -> Result<(), RunError> {
        warn!(run_id = %run.id, state = %run.state, "Aborting run");
        checkpointer
            .commit(
                run,
                RunEvent::RunAborted {
                    reason: "cancelled by request".to_string(),
                    at: Utc::now(),
                },
            )
            .await?;
        Ok(())
    }

    /// Mark the run failed in memory and try once more to persist it.
    async fn fail_on_infrastructure(
        &self,
        run: &mut Run,
        checkpointer: &mut Checkpointer,
        err: &RunError,
    ) {
        if run.state.is_terminal() {
            return;
        }
        let event = RunEvent::RunFailed {
            failure: RunFailure {
                cause: FailureCause::Infrastructure,
                phase: run.current().map(|p| p.id.clone()),
                tasks: Vec::new(),
                reason: err.to_string(),
            },
            at: Utc::now(),
        };
        error!(run_id = %run.id, error = %err, "Checkpoint store unavailable, failing run");
        if run.apply(&event).is_ok()
            && let Err(e) = checkpointer.record(run, &event).await
        {
            warn!(run_id = %run.id, error = %e, "Could not persist infrastructure failure");
        }
    }

    async fn emit(&self, event: ProgressEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Failure record for a rejected phase: task failures when tasks failed,
/// otherwise the quality bar was not met.
fn failure_for_rejection(phase: &PhaseId, record: Option<&GateRecord>) -> RunFailure {
    let reason = record
        .and_then(|r| r.decision.reason())
        .unwrap_or("phase rejected")
        .to_string();
    match record {
        Some(r) if !r.failed_tasks.is_empty() => RunFailure {
            cause: FailureCause::TaskFailures,
            phase: Some(phase.clone()),
            tasks: r.failed_tasks.clone(),
            reason,
        },
        _ => RunFailure {
            cause: FailureCause::QualityGate,
            phase: Some(phase.clone()),
            tasks: record
                .map(|r| r.blocking_issues.iter().filter_map(|i| i.task.clone()).collect())
                .unwrap_or_default(),
            reason,
        },
    }
}
