//! Run report: counts and per-role statistics derived from a run.

use crate::graph::StatusCounts;
use crate::model::{GateDecision, PhaseId, PhaseKind, PhaseStatus, Role, Run, RunState, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statistics for all tasks assigned to one role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleStats {
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Dispatch tries across all attempts
    pub tries: u32,
    /// Average wall-clock time of finished attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub id: PhaseId,
    pub kind: PhaseKind,
    pub status: PhaseStatus,
    pub revision_rounds: u32,
    pub counts: StatusCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<GateDecision>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub state: RunState,
    pub totals: StatusCounts,
    pub phases: Vec<PhaseSummary>,
    pub roles: BTreeMap<Role, RoleStats>,
    /// Milliseconds from creation to the terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl RunReport {
    pub fn from_run(run: &Run) -> Self {
        let phases = run
            .phases
            .iter()
            .map(|p| PhaseSummary {
                id: p.id.clone(),
                kind: p.kind,
                status: p.status,
                revision_rounds: p.revision_rounds,
                counts: run.graph.status_counts(Some(&p.id)),
                last_decision: p.last_gate().map(|g| g.decision.clone()),
            })
            .collect();

        let mut roles: BTreeMap<Role, RoleStats> = BTreeMap::new();
        let mut durations: BTreeMap<Role, Vec<i64>> = BTreeMap::new();
        for task in run.graph.tasks() {
            let stats = roles.entry(task.role.clone()).or_default();
            stats.tasks += 1;
            match task.status {
                TaskStatus::Succeeded => stats.succeeded += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Skipped => stats.skipped += 1,
                _ => {}
            }
            stats.tries += task.tries + task.history.iter().map(|h| h.tries).sum::<u32>();
            if let Some(d) = task.duration() {
                durations
                    .entry(task.role.clone())
                    .or_default()
                    .push(d.num_milliseconds());
            }
        }
        for (role, samples) in durations {
            if let Some(stats) = roles.get_mut(&role)
                && !samples.is_empty()
            {
                let total: i64 = samples.iter().sum();
                stats.avg_duration_ms = Some((total / samples.len() as i64).max(0) as u64);
            }
        }

        Self {
            state: run.state,
            totals: run.graph.status_counts(None),
            phases,
            roles,
            duration_ms: run
                .finished_at
                .map(|end| (end - run.created_at).num_milliseconds().max(0) as u64),
        }
    }

    /// Share of tasks that succeeded, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.totals.total();
        if total == 0 {
            return 100.0;
        }
        (self.totals.succeeded as f64 / total as f64) * 100.0
    }

    pub fn revision_rounds(&self) -> u32 {
        self.phases.iter().map(|p| p.revision_rounds).sum()
    }
}
