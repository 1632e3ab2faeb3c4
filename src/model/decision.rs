//! Gate decisions and the evidence recorded with them.

use crate::model::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verdict applied to a phase's aggregate output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Approve,
    /// Re-run `targets` (a new attempt each) and evaluate again.
    Revise { reason: String, targets: Vec<TaskId> },
    /// Fatal to the run.
    Reject { reason: String },
}

impl GateDecision {
    pub fn is_approve(&self) -> bool {
        matches!(self, Self::Approve)
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Approve => None,
            Self::Revise { reason, .. } | Self::Reject { reason } => Some(reason),
        }
    }
}

/// A finding reported by a task, e.g. by a reviewer role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub category: String,
    #[serde(default)]
    pub message: String,
    /// Task that reported the issue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
}

/// One gate evaluation of a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    /// Revision rounds the phase had consumed when this decision was made
    pub round: u32,
    pub decision: GateDecision,
    /// Lowest score reported by the phase's tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
    #[serde(default)]
    pub failed_tasks: Vec<TaskId>,
    #[serde(default)]
    pub blocking_issues: Vec<Issue>,
    #[serde(default)]
    pub missing_artifacts: Vec<String>,
    pub decided_at: DateTime<Utc>,
}
