//! Typed error hierarchy for conductor.
//!
//! - `ValidationError`: malformed run specs, rejected before execution
//! - `GraphError`: task graph construction and transition errors
//! - `StoreError`: checkpoint persistence failures (infrastructure)
//! - `RunError`: everything that can terminate or refuse a run
//!
//! Worker failures and timeouts are not errors: they are `Outcome` values the
//! scheduler absorbs into task state.

use crate::model::{PhaseId, RunId, RunState, TaskId, TaskStatus};
use std::path::PathBuf;
use thiserror::Error;

/// A run spec failed validation. Every problem found is listed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid run spec: {}", problems.join("; "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    pub fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }
}

/// Errors from building or mutating the task graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle detected in phase {phase}. Involved tasks: {tasks:?}")]
    Cycle { phase: PhaseId, tasks: Vec<TaskId> },

    #[error("Unknown prerequisite '{prerequisite}' in task '{task}': no task with that id exists")]
    UnknownPrerequisite { task: TaskId, prerequisite: TaskId },

    #[error("Duplicate task id: {task}")]
    DuplicateTask { task: TaskId },

    #[error("Task {task} not found")]
    UnknownTask { task: TaskId },

    #[error("Phase {phase} not found")]
    UnknownPhase { phase: PhaseId },

    #[error(
        "Task '{task}' depends on '{prerequisite}' from later phase {prerequisite_phase}"
    )]
    CrossPhaseDependency {
        task: TaskId,
        prerequisite: TaskId,
        prerequisite_phase: PhaseId,
    },

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Errors from a checkpoint store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Corrupt checkpoint at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Checkpoint {seq} already written for run {run}")]
    SequenceExists { run: RunId, seq: u64 },

    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that refuse or terminate a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Checkpoint store failed after {attempts} attempts: {source}")]
    Infrastructure {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidState { from: RunState, to: RunState },

    #[error("Run {run} not found")]
    UnknownRun { run: RunId },

    #[error("Run {run} is already running")]
    AlreadyRunning { run: RunId },

    #[error("Run {run} already finished with state {state}")]
    Terminal { run: RunId, state: RunState },
}
