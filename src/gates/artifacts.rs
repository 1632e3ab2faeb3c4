//! Phase artifacts: the findings a gate looks at, read from task results.
//!
//! A task result is opaque JSON, but a few top-level keys are understood:
//!
//! ```json
//! {"score": 85, "issues": [{"category": "security", "message": "..."}], "revise": ["P1"]}
//! ```

use crate::graph::TaskGraph;
use crate::model::{Issue, PhaseId, Role, TaskId, TaskStatus};
use serde::Deserialize;
use serde_json::Value;

/// What one task of the phase reported.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task: TaskId,
    pub role: Role,
    pub status: TaskStatus,
    pub score: Option<u32>,
    pub issues: Vec<Issue>,
    /// Tasks the reporter wants redone
    pub revise: Vec<TaskId>,
    /// Top-level keys of the result object
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    category: String,
    #[serde(default)]
    message: String,
}

impl TaskReport {
    fn from_result(task: TaskId, role: Role, status: TaskStatus, result: Option<&Value>) -> Self {
        let object = result.and_then(Value::as_object);

        let score = object
            .and_then(|o| o.get("score"))
            .and_then(Value::as_f64)
            .map(|s| s.round().clamp(0.0, 100.0) as u32);

        let issues = object
            .and_then(|o| o.get("issues"))
            .and_then(|v| serde_json::from_value::<Vec<RawIssue>>(v.clone()).ok())
            .unwrap_or_default()
            .into_iter()
            .map(|raw| Issue {
                category: raw.category,
                message: raw.message,
                task: Some(task.clone()),
            })
            .collect();

        let revise = object
            .and_then(|o| o.get("revise"))
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(TaskId::from)
                    .collect()
            })
            .unwrap_or_default();

        let keys = object
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();

        Self {
            task,
            role,
            status,
            score,
            issues,
            revise,
            keys,
        }
    }
}

/// Aggregate output of a phase, in task insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseArtifacts {
    pub reports: Vec<TaskReport>,
    pub failed: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
}

impl PhaseArtifacts {
    /// Read the findings of every task of `phase`.
    pub fn collect(graph: &TaskGraph, phase: &PhaseId) -> Self {
        let mut artifacts = Self::default();
        for task in graph.tasks_in_phase(phase) {
            match task.status {
                TaskStatus::Failed => artifacts.failed.push(task.id.clone()),
                TaskStatus::Skipped => artifacts.skipped.push(task.id.clone()),
                _ => {}
            }
            artifacts.reports.push(TaskReport::from_result(
                task.id.clone(),
                task.role.clone(),
                task.status,
                task.result.as_ref(),
            ));
        }
        artifacts
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Lowest score reported by any task.
    pub fn min_score(&self) -> Option<u32> {
        self.reports.iter().filter_map(|r| r.score).min()
    }

    pub fn contains(&self, task: &TaskId) -> bool {
        self.reports.iter().any(|r| &r.task == task)
    }
}
