//! Phase execution results and progress events.

use crate::graph::StatusCounts;
use crate::model::{GateDecision, PhaseId, RunId, RunState, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Result of running one phase to quiescence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: PhaseId,
    /// Task counts of the phase when the loop stopped
    pub counts: StatusCounts,
    #[serde(default)]
    pub failed: Vec<TaskId>,
    #[serde(default)]
    pub skipped: Vec<TaskId>,
    /// The loop stopped because the run was cancelled
    #[serde(default)]
    pub cancelled: bool,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl PhaseResult {
    /// Every task of the phase succeeded.
    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.counts.succeeded == self.counts.total()
    }

    /// No task of the phase is left to schedule.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.counts.open() == 0
    }
}

/// Events emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted {
        phase: PhaseId,
        round: u32,
    },
    TaskDispatched {
        task: TaskId,
        attempt: u32,
    },
    TaskFinished {
        task: TaskId,
        status: TaskStatus,
        tries: u32,
    },
    /// Tasks skipped because a prerequisite failed
    TasksSkipped {
        tasks: Vec<TaskId>,
    },
    PhaseFinished {
        result: Box<PhaseResult>,
    },
    GateDecided {
        phase: PhaseId,
        decision: GateDecision,
    },
    RunFinished {
        run: RunId,
        state: RunState,
    },
}

/// Tracks execution timing.
pub(crate) struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Durations serialize as milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(counts: StatusCounts, cancelled: bool) -> PhaseResult {
        PhaseResult {
            phase: PhaseId::new("impl"),
            counts,
            failed: vec![],
            skipped: vec![],
            cancelled,
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_phase_result_predicates() {
        let ok = result(
            StatusCounts {
                succeeded: 3,
                ..Default::default()
            },
            false,
        );
        assert!(ok.all_succeeded());
        assert!(ok.is_complete());

        let partial = result(
            StatusCounts {
                succeeded: 1,
                failed: 1,
                skipped: 1,
                ..Default::default()
            },
            false,
        );
        assert!(!partial.all_succeeded());
        assert!(partial.is_complete());

        let cancelled = result(
            StatusCounts {
                running: 1,
                ..Default::default()
            },
            true,
        );
        assert!(!cancelled.is_complete());
    }

    #[test]
    fn test_phase_result_duration_serializes_as_millis() {
        let json = serde_json::to_value(result(StatusCounts::default(), false)).unwrap();
        assert_eq!(json["duration"], 1500);
    }

    #[test]
    fn test_progress_event_serialization() {
        let event = ProgressEvent::TaskDispatched {
            task: TaskId::new("A"),
            attempt: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("task_dispatched"));
        assert!(json.contains("\"A\""));
    }
}
