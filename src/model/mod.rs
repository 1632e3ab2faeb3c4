//! Domain model: ids, tasks, phases, runs and the events that change them.

mod decision;
mod event;
mod ids;
mod phase;
mod run;
mod spec;
mod task;

pub use decision::{GateDecision, GateRecord, Issue};
pub use event::{Applied, RunEvent};
pub use ids::{AttemptToken, PhaseId, Role, RunId, TaskId};
pub use phase::{Phase, PhaseKind, PhaseStatus};
pub use run::{FailureCause, Run, RunFailure, RunState};
pub use spec::{PhaseSpec, RunSpec, SpecRules, TaskSpec};
pub use task::{AttemptRecord, SkipReason, Task, TaskStatus, TaskUpdate};
