//! Run: the top-level aggregate owning phases and the task graph.

use crate::errors::{GraphError, RunError};
use crate::graph::TaskGraph;
use crate::model::{
    Applied, GateDecision, Phase, PhaseId, PhaseKind, PhaseStatus, RunEvent, RunId, TaskId,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Controller state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Created,
    PlanningActive,
    PlanningGated,
    ImplementationActive,
    ImplementationGated,
    QaActive,
    QaGated,
    Completed,
    Failed,
    Aborted,
}

impl RunState {
    pub fn active(kind: PhaseKind) -> Self {
        match kind {
            PhaseKind::Planning => Self::PlanningActive,
            PhaseKind::Implementation => Self::ImplementationActive,
            PhaseKind::Qa => Self::QaActive,
        }
    }

    pub fn gated(kind: PhaseKind) -> Self {
        match kind {
            PhaseKind::Planning => Self::PlanningGated,
            PhaseKind::Implementation => Self::ImplementationGated,
            PhaseKind::Qa => Self::QaGated,
        }
    }

    /// Phase kind of an active or gated state.
    pub fn phase_kind(&self) -> Option<PhaseKind> {
        match self {
            Self::PlanningActive | Self::PlanningGated => Some(PhaseKind::Planning),
            Self::ImplementationActive | Self::ImplementationGated => {
                Some(PhaseKind::Implementation)
            }
            Self::QaActive | Self::QaGated => Some(PhaseKind::Qa),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::PlanningActive | Self::ImplementationActive | Self::QaActive
        )
    }

    pub fn is_gated(&self) -> bool {
        matches!(
            self,
            Self::PlanningGated | Self::ImplementationGated | Self::QaGated
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Whether `self -> to` is a legal controller transition.
    pub fn can_transition_to(&self, to: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Self::Failed | Self::Aborted) {
            return true;
        }
        match (self.phase_kind(), to.phase_kind()) {
            // Created -> first phase, or straight to completion when there are none
            (None, Some(_)) => to.is_active(),
            (None, None) => to == Self::Completed,
            (Some(from), Some(next)) if self.is_active() => to == Self::gated(from) && next == from,
            // Gated -> revise (same kind) or the next phase
            (Some(from), Some(next)) => to.is_active() && next >= from,
            (Some(_), None) => self.is_gated() && to == Self::Completed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PlanningActive => "planning_active",
            Self::PlanningGated => "planning_gated",
            Self::ImplementationActive => "implementation_active",
            Self::ImplementationGated => "implementation_gated",
            Self::QaActive => "qa_active",
            Self::QaGated => "qa_gated",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run failed or was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Tasks exhausted their retries and revisions could not fix them
    TaskFailures,
    /// Phase output did not meet the quality bar
    QualityGate,
    /// Checkpoint store unavailable after its retry budget
    Infrastructure,
    Validation,
    Cancelled,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskFailures => "task_failures",
            Self::QualityGate => "quality_gate",
            Self::Infrastructure => "infrastructure",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Structured failure record reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub cause: FailureCause,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseId>,
    #[serde(default)]
    pub tasks: Vec<TaskId>,
    pub reason: String,
}

/// One end-to-end execution of the phased pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    #[serde(default)]
    pub title: String,
    pub state: RunState,
    pub phases: Vec<Phase>,
    pub graph: TaskGraph,
    /// Index into `phases` of the phase being worked on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(id: RunId, title: impl Into<String>, phases: Vec<Phase>, graph: TaskGraph) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            state: RunState::Created,
            phases,
            graph,
            current_phase: None,
            failure: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn phase(&self, id: &PhaseId) -> Option<&Phase> {
        self.phases.iter().find(|p| &p.id == id)
    }

    pub fn current(&self) -> Option<&Phase> {
        self.current_phase.and_then(|i| self.phases.get(i))
    }

    /// The first phase that has not been approved yet.
    pub fn next_pending_phase(&self) -> Option<&Phase> {
        self.phases.iter().find(|p| p.status == PhaseStatus::Pending)
    }

    /// Apply one event. The only mutation path for a run.
    pub fn apply(&mut self, event: &RunEvent) -> Result<Applied, RunError> {
        if self.state.is_terminal() {
            return Err(RunError::Terminal {
                run: self.id.clone(),
                state: self.state,
            });
        }

        let mut applied = Applied::default();
        let at = match event {
            RunEvent::PhaseActivated { phase, at } => {
                let idx = self.phase_index(phase)?;
                if self.phases[..idx].iter().any(|p| p.status != PhaseStatus::Approved)
                    || self.phases[idx].status != PhaseStatus::Pending
                {
                    return Err(self.invalid_state(RunState::active(self.phases[idx].kind)));
                }
                self.transition(RunState::active(self.phases[idx].kind))?;
                let p = &mut self.phases[idx];
                p.status = PhaseStatus::Active;
                p.activated_at = Some(*at);
                self.current_phase = Some(idx);
                *at
            }
            RunEvent::TaskReady { task, at } => {
                self.ensure_task_in_active_phase(task)?;
                self.graph
                    .mark_status(task, TaskStatus::Ready, Default::default(), *at)?;
                *at
            }
            RunEvent::TaskStarted { task, at } => {
                self.ensure_task_in_active_phase(task)?;
                self.graph
                    .mark_status(task, TaskStatus::Running, Default::default(), *at)?;
                *at
            }
            RunEvent::TaskFinished {
                task,
                status,
                update,
                at,
            } => {
                self.ensure_task_in_active_phase(task)?;
                if !status.is_terminal() {
                    let from = self.graph.get(task).map(|t| t.status).unwrap_or_default();
                    return Err(GraphError::InvalidTransition {
                        task: task.clone(),
                        from,
                        to: *status,
                    }
                    .into());
                }
                applied.skipped = self.graph.mark_status(task, *status, update.clone(), *at)?;
                *at
            }
            RunEvent::PhaseGated { phase, at } => {
                let idx = self.current_index_of(phase, PhaseStatus::Active)?;
                let kind = self.phases[idx].kind;
                if !self.graph.phase_complete(phase) {
                    return Err(self.invalid_state(RunState::gated(kind)));
                }
                self.transition(RunState::gated(kind))?;
                self.phases[idx].status = PhaseStatus::Gated;
                *at
            }
            RunEvent::GateDecided { phase, record } => {
                let idx = self.current_index_of(phase, PhaseStatus::Gated)?;
                let at = record.decided_at;
                match &record.decision {
                    GateDecision::Approve => {
                        self.phases[idx].status = PhaseStatus::Approved;
                        self.phases[idx].closed_at = Some(at);
                    }
                    GateDecision::Revise { targets, .. } => {
                        let kind = self.phases[idx].kind;
                        applied.reset = self.graph.revise(targets, at)?;
                        self.transition(RunState::active(kind))?;
                        let p = &mut self.phases[idx];
                        p.revision_rounds += 1;
                        p.status = PhaseStatus::Active;
                    }
                    GateDecision::Reject { .. } => {
                        self.phases[idx].status = PhaseStatus::Rejected;
                        self.phases[idx].closed_at = Some(at);
                    }
                }
                self.phases[idx].gate_records.push(record.clone());
                at
            }
            RunEvent::RunCompleted { at } => {
                if self.phases.iter().any(|p| p.status != PhaseStatus::Approved) {
                    return Err(self.invalid_state(RunState::Completed));
                }
                self.transition(RunState::Completed)?;
                self.finished_at = Some(*at);
                *at
            }
            RunEvent::RunFailed { failure, at } => {
                self.transition(RunState::Failed)?;
                self.failure = Some(failure.clone());
                self.finished_at = Some(*at);
                *at
            }
            RunEvent::RunAborted { reason, at } => {
                self.transition(RunState::Aborted)?;
                applied.skipped = self.graph.cancel_open(*at);
                self.failure = Some(RunFailure {
                    cause: FailureCause::Cancelled,
                    phase: self.current().map(|p| p.id.clone()),
                    tasks: applied.skipped.clone(),
                    reason: if reason.is_empty() {
                        "run cancelled".to_string()
                    } else {
                        reason.clone()
                    },
                });
                self.finished_at = Some(*at);
                *at
            }
        };

        self.updated_at = at;
        Ok(applied)
    }

    fn transition(&mut self, to: RunState) -> Result<(), RunError> {
        if !self.state.can_transition_to(to) {
            return Err(self.invalid_state(to));
        }
        self.state = to;
        Ok(())
    }

    fn invalid_state(&self, to: RunState) -> RunError {
        RunError::InvalidState {
            from: self.state,
            to,
        }
    }

    fn phase_index(&self, id: &PhaseId) -> Result<usize, RunError> {
        self.phases
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| GraphError::UnknownPhase { phase: id.clone() }.into())
    }

    /// Index of `id`, which must be the current phase in `status`.
    fn current_index_of(&self, id: &PhaseId, status: PhaseStatus) -> Result<usize, RunError> {
        let idx = self.phase_index(id)?;
        if self.current_phase != Some(idx) || self.phases[idx].status != status {
            return Err(self.invalid_state(self.state));
        }
        Ok(idx)
    }

    fn ensure_task_in_active_phase(&self, task: &TaskId) -> Result<(), RunError> {
        let t = self
            .graph
            .get(task)
            .ok_or_else(|| GraphError::UnknownTask { task: task.clone() })?;
        match self.current() {
            Some(p) if p.id == t.phase && p.status == PhaseStatus::Active => Ok(()),
            _ => Err(self.invalid_state(self.state)),
        }
    }
}
