//! Task: the smallest schedulable unit.

use crate::model::{PhaseId, Role, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for prerequisites
    #[default]
    Pending,
    /// Prerequisites satisfied, waiting for a dispatch slot
    Ready,
    /// Dispatched to a worker
    Running,
    Succeeded,
    Failed,
    /// Never ran (dependency failure or cancellation)
    Skipped,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether a direct transition `self -> to` is allowed.
    ///
    /// Terminal statuses never transition; revision creates a new attempt instead.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Ready | Running | Skipped)
                | (Ready, Running | Skipped)
                | (Running, Succeeded | Failed | Skipped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A transitive prerequisite failed or was skipped; `task` is the origin.
    DependencyFailed { task: TaskId },
    /// The run was aborted before or while the task ran.
    Cancelled,
}

/// Fields recorded alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Dispatch tries consumed by the current attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tries: Option<u32>,
}

impl TaskUpdate {
    pub fn succeeded(result: serde_json::Value, tries: u32) -> Self {
        Self {
            result: Some(result),
            tries: Some(tries),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, tries: u32) -> Self {
        Self {
            error: Some(error.into()),
            tries: Some(tries),
            ..Default::default()
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Default::default()
        }
    }
}

/// Outcome of a finished attempt, kept after a revision resets the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A unit of work assigned to a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub phase: PhaseId,
    pub role: Role,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Opaque input handed to the worker
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Attempt number, starting at 1 and incremented by each revision
    pub attempt: u32,
    /// Dispatch tries consumed by the current attempt
    #[serde(default)]
    pub tries: u32,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, phase: impl Into<PhaseId>, role: impl Into<Role>) -> Self {
        Self {
            id: id.into(),
            phase: phase.into(),
            role: role.into(),
            title: String::new(),
            depends_on: Vec::new(),
            payload: serde_json::Value::Null,
            success_criteria: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            skip_reason: None,
            attempt: 1,
            tries: 0,
            history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_success_criteria(mut self, criteria: Vec<String>) -> Self {
        self.success_criteria = criteria;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time of the current attempt, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Archive the finished attempt and start a fresh one.
    pub(crate) fn start_new_attempt(&mut self) {
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            status: self.status,
            result: self.result.take(),
            error: self.error.take(),
            tries: self.tries,
            finished_at: self.finished_at,
        });
        self.attempt += 1;
        self.tries = 0;
        self.status = TaskStatus::Pending;
        self.skip_reason = None;
        self.started_at = None;
        self.finished_at = None;
    }
}
