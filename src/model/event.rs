//! Run events: the only way a `Run` changes.
//!
//! The controller and scheduler build events, apply them through
//! `Run::apply`, and checkpoint them in application order. Recovery replays
//! the same events through the same function.

use crate::model::{GateRecord, PhaseId, RunFailure, TaskId, TaskStatus, TaskUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A pending phase becomes the active phase.
    PhaseActivated { phase: PhaseId, at: DateTime<Utc> },
    /// A pending task's prerequisites all succeeded.
    TaskReady { task: TaskId, at: DateTime<Utc> },
    /// A task was handed to the dispatcher.
    TaskStarted { task: TaskId, at: DateTime<Utc> },
    /// A dispatch finished; `status` is terminal.
    TaskFinished {
        task: TaskId,
        status: TaskStatus,
        #[serde(default)]
        update: TaskUpdate,
        at: DateTime<Utc>,
    },
    /// Every task of the active phase is terminal.
    PhaseGated { phase: PhaseId, at: DateTime<Utc> },
    /// The gate evaluated a gated phase.
    GateDecided { phase: PhaseId, record: GateRecord },
    RunCompleted { at: DateTime<Utc> },
    RunFailed { failure: RunFailure, at: DateTime<Utc> },
    /// Cancellation finished; open tasks become skipped.
    RunAborted {
        #[serde(default)]
        reason: String,
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PhaseActivated { .. } => "phase_activated",
            Self::TaskReady { .. } => "task_ready",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskFinished { .. } => "task_finished",
            Self::PhaseGated { .. } => "phase_gated",
            Self::GateDecided { .. } => "gate_decided",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunAborted { .. } => "run_aborted",
        }
    }

    /// Phase boundaries trigger a full snapshot.
    pub fn is_phase_boundary(&self) -> bool {
        matches!(
            self,
            Self::PhaseActivated { .. }
                | Self::GateDecided { .. }
                | Self::RunCompleted { .. }
                | Self::RunFailed { .. }
                | Self::RunAborted { .. }
        )
    }
}

/// Side effects of applying one event, for logging and progress reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    /// Tasks skipped by a cascade
    pub skipped: Vec<TaskId>,
    /// Tasks reset to a new attempt by a revision
    pub reset: Vec<TaskId>,
}
