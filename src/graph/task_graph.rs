//! The task graph: tasks, their prerequisites, and status transitions.

use crate::errors::GraphError;
use crate::model::{PhaseId, SkipReason, Task, TaskId, TaskStatus, TaskUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Index into the task list.
type TaskIndex = usize;

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.succeeded + self.failed + self.skipped
    }

    /// Tasks that still need scheduling work.
    pub fn open(&self) -> usize {
        self.pending + self.ready + self.running
    }

    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Ready => self.ready += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Serialized form: indices are rebuilt on load.
#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    phases: Vec<PhaseId>,
    tasks: Vec<Task>,
}

/// Directed acyclic graph of tasks grouped into ordered phases.
///
/// Tasks keep their insertion order; every query that returns several tasks
/// returns them in that order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphSnapshot", into = "GraphSnapshot")]
pub struct TaskGraph {
    /// Phase ids in run order
    phases: Vec<PhaseId>,
    tasks: Vec<Task>,
    index_map: HashMap<TaskId, TaskIndex>,
    /// index -> tasks it depends on
    prerequisites: Vec<Vec<TaskIndex>>,
    /// index -> tasks that depend on it
    dependents: Vec<Vec<TaskIndex>>,
}

impl TryFrom<GraphSnapshot> for TaskGraph {
    type Error = GraphError;

    fn try_from(snapshot: GraphSnapshot) -> Result<Self, Self::Error> {
        Self::from_tasks(snapshot.phases, snapshot.tasks)
    }
}

impl From<TaskGraph> for GraphSnapshot {
    fn from(graph: TaskGraph) -> Self {
        Self {
            phases: graph.phases,
            tasks: graph.tasks,
        }
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a batch of tasks.
    ///
    /// Unlike `add_task`, prerequisites may reference tasks later in the list
    /// as long as they belong to the same or an earlier phase. The batch is
    /// validated for unknown prerequisites and cycles.
    pub fn from_tasks(phases: Vec<PhaseId>, tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut graph = Self {
            phases,
            ..Default::default()
        };

        for task in tasks {
            graph.phase_position(&task.phase).ok_or_else(|| GraphError::UnknownPhase {
                phase: task.phase.clone(),
            })?;
            if graph.index_map.contains_key(&task.id) {
                return Err(GraphError::DuplicateTask { task: task.id });
            }
            graph.index_map.insert(task.id.clone(), graph.tasks.len());
            graph.tasks.push(task);
            graph.prerequisites.push(Vec::new());
            graph.dependents.push(Vec::new());
        }

        for to_idx in 0..graph.tasks.len() {
            let deps = graph.tasks[to_idx].depends_on.clone();
            for dep in deps {
                let from_idx = graph.resolve_prerequisite(to_idx, &dep)?;
                graph.link(from_idx, to_idx);
            }
        }

        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// Register a phase at the end of the phase order. Re-registering is a no-op.
    pub fn add_phase(&mut self, phase: impl Into<PhaseId>) {
        let phase = phase.into();
        if !self.phases.contains(&phase) {
            self.phases.push(phase);
        }
    }

    /// Add a task whose prerequisites already exist in the graph.
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        self.phase_position(&task.phase)
            .ok_or_else(|| GraphError::UnknownPhase {
                phase: task.phase.clone(),
            })?;
        if self.index_map.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask { task: task.id });
        }

        let idx = self.tasks.len();
        let mut from = Vec::with_capacity(task.depends_on.len());
        for dep in &task.depends_on {
            if *dep == task.id {
                return Err(GraphError::Cycle {
                    phase: task.phase.clone(),
                    tasks: vec![task.id.clone()],
                });
            }
            let from_idx = *self
                .index_map
                .get(dep)
                .ok_or_else(|| GraphError::UnknownPrerequisite {
                    task: task.id.clone(),
                    prerequisite: dep.clone(),
                })?;
            self.check_phase_order(&task, from_idx)?;
            from.push(from_idx);
        }

        self.index_map.insert(task.id.clone(), idx);
        self.tasks.push(task);
        self.prerequisites.push(Vec::new());
        self.dependents.push(Vec::new());
        for from_idx in from {
            self.link(from_idx, idx);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn phases(&self) -> &[PhaseId] {
        &self.phases
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index_map.get(id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index_map.contains_key(id)
    }

    /// Tasks of a phase, in insertion order.
    pub fn tasks_in_phase<'a>(&'a self, phase: &'a PhaseId) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks.iter().filter(move |t| &t.phase == phase)
    }

    /// Tasks of a phase with the given status, in insertion order.
    pub fn tasks_with_status<'a>(&'a self, phase: &'a PhaseId, status: TaskStatus) -> Vec<&'a Task> {
        self.tasks_in_phase(phase)
            .filter(|t| t.status == status)
            .collect()
    }

    /// Direct prerequisites of a task.
    pub fn prerequisites_of(&self, id: &TaskId) -> Vec<&Task> {
        self.index_map
            .get(id)
            .map(|&i| self.prerequisites[i].iter().map(|&p| &self.tasks[p]).collect())
            .unwrap_or_default()
    }

    /// Direct dependents of a task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        self.index_map
            .get(id)
            .map(|&i| self.dependents[i].iter().map(|&d| &self.tasks[d]).collect())
            .unwrap_or_default()
    }

    /// Pending tasks of `phase` whose prerequisites have all succeeded.
    ///
    /// Recomputed on every call.
    pub fn ready_tasks(&self, phase: &PhaseId) -> Vec<&Task> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(i, t)| {
                &t.phase == phase
                    && t.status == TaskStatus::Pending
                    && self.prerequisites_satisfied(*i)
            })
            .map(|(_, t)| t)
            .collect()
    }

    /// Whether every task of the phase reached a terminal status.
    pub fn phase_complete(&self, phase: &PhaseId) -> bool {
        self.tasks_in_phase(phase).all(|t| t.is_terminal())
    }

    /// Status counts for one phase, or for the whole graph.
    pub fn status_counts(&self, phase: Option<&PhaseId>) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            if phase.is_none_or(|p| &task.phase == p) {
                counts.add(task.status);
            }
        }
        counts
    }

    /// Transition a task, enforcing the transition table.
    ///
    /// Marking a task `failed` or `skipped` cascades `skipped` to every
    /// non-terminal transitive dependent. The cascaded task ids are returned.
    pub fn mark_status(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        update: TaskUpdate,
        at: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let idx = self.index_of(id)?;
        let from = self.tasks[idx].status;
        let invalid = || GraphError::InvalidTransition {
            task: id.clone(),
            from,
            to: status,
        };
        if !from.can_transition_to(status) {
            return Err(invalid());
        }
        if matches!(status, TaskStatus::Ready | TaskStatus::Running)
            && !self.prerequisites_satisfied(idx)
        {
            return Err(invalid());
        }

        let task = &mut self.tasks[idx];
        task.status = status;
        if let Some(tries) = update.tries {
            task.tries = tries;
        }
        match status {
            TaskStatus::Running => task.started_at = Some(at),
            TaskStatus::Succeeded => {
                task.result = update.result;
                task.finished_at = Some(at);
            }
            TaskStatus::Failed => {
                task.error = update.error;
                task.finished_at = Some(at);
            }
            TaskStatus::Skipped => {
                task.skip_reason = Some(update.skip_reason.unwrap_or(SkipReason::Cancelled));
                task.error = update.error;
                task.finished_at = Some(at);
            }
            TaskStatus::Pending | TaskStatus::Ready => {}
        }

        if matches!(status, TaskStatus::Failed | TaskStatus::Skipped) {
            let origin = self.skip_origin(idx);
            Ok(self.cascade_skip(idx, &origin, at))
        } else {
            Ok(Vec::new())
        }
    }

    /// Start a new attempt for each named terminal task.
    ///
    /// Tasks that were skipped because of a revised task are reset as well;
    /// every other task keeps its status. Returns the reset task ids in
    /// insertion order.
    pub fn revise(&mut self, ids: &[TaskId], at: DateTime<Utc>) -> Result<Vec<TaskId>, GraphError> {
        let mut targets = HashSet::new();
        for id in ids {
            let idx = self.index_of(id)?;
            let status = self.tasks[idx].status;
            if !status.is_terminal() {
                return Err(GraphError::InvalidTransition {
                    task: id.clone(),
                    from: status,
                    to: TaskStatus::Pending,
                });
            }
            targets.insert(idx);
        }

        let origins: HashSet<TaskId> = targets.iter().map(|&i| self.tasks[i].id.clone()).collect();
        let cascaded: Vec<TaskIndex> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                matches!(&t.skip_reason, Some(SkipReason::DependencyFailed { task }) if origins.contains(task))
            })
            .map(|(i, _)| i)
            .collect();
        targets.extend(cascaded);

        let mut reset: Vec<TaskIndex> = targets.into_iter().collect();
        reset.sort_unstable();
        for &idx in &reset {
            self.tasks[idx].start_new_attempt();
        }

        // A reset task may still have another failed prerequisite.
        self.settle(at);

        Ok(reset.into_iter().map(|i| self.tasks[i].id.clone()).collect())
    }

    /// Skip every non-terminal task that has a failed or skipped prerequisite.
    pub fn settle(&mut self, at: DateTime<Utc>) -> Vec<TaskId> {
        let mut skipped = Vec::new();
        for idx in 0..self.tasks.len() {
            if matches!(self.tasks[idx].status, TaskStatus::Failed | TaskStatus::Skipped) {
                let origin = self.skip_origin(idx);
                skipped.extend(self.cascade_skip(idx, &origin, at));
            }
        }
        skipped
    }

    /// Skip every non-terminal task with reason `cancelled`. No cascade.
    pub fn cancel_open(&mut self, at: DateTime<Utc>) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for task in self.tasks.iter_mut().filter(|t| !t.is_terminal()) {
            task.status = TaskStatus::Skipped;
            task.skip_reason = Some(SkipReason::Cancelled);
            task.finished_at = Some(at);
            cancelled.push(task.id.clone());
        }
        cancelled
    }

    fn index_of(&self, id: &TaskId) -> Result<TaskIndex, GraphError> {
        self.index_map
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask { task: id.clone() })
    }

    fn phase_position(&self, phase: &PhaseId) -> Option<usize> {
        self.phases.iter().position(|p| p == phase)
    }

    fn link(&mut self, from: TaskIndex, to: TaskIndex) {
        self.dependents[from].push(to);
        self.prerequisites[to].push(from);
    }

    fn resolve_prerequisite(&self, to_idx: TaskIndex, dep: &TaskId) -> Result<TaskIndex, GraphError> {
        let task = &self.tasks[to_idx];
        let from_idx = *self
            .index_map
            .get(dep)
            .ok_or_else(|| GraphError::UnknownPrerequisite {
                task: task.id.clone(),
                prerequisite: dep.clone(),
            })?;
        self.check_phase_order(task, from_idx)?;
        Ok(from_idx)
    }

    /// A prerequisite must live in the task's own phase or an earlier one.
    fn check_phase_order(&self, task: &Task, prerequisite: TaskIndex) -> Result<(), GraphError> {
        let dep = &self.tasks[prerequisite];
        let task_pos = self.phase_position(&task.phase);
        let dep_pos = self.phase_position(&dep.phase);
        if dep_pos > task_pos {
            return Err(GraphError::CrossPhaseDependency {
                task: task.id.clone(),
                prerequisite: dep.id.clone(),
                prerequisite_phase: dep.phase.clone(),
            });
        }
        Ok(())
    }

    fn prerequisites_satisfied(&self, idx: TaskIndex) -> bool {
        self.prerequisites[idx]
            .iter()
            .all(|&p| self.tasks[p].status == TaskStatus::Succeeded)
    }

    /// The task a skip cascade starting at `idx` should be attributed to.
    fn skip_origin(&self, idx: TaskIndex) -> TaskId {
        match &self.tasks[idx].skip_reason {
            Some(SkipReason::DependencyFailed { task }) if self.tasks[idx].status == TaskStatus::Skipped => {
                task.clone()
            }
            _ => self.tasks[idx].id.clone(),
        }
    }

    fn cascade_skip(&mut self, start: TaskIndex, origin: &TaskId, at: DateTime<Utc>) -> Vec<TaskId> {
        let mut skipped = Vec::new();
        let mut stack: Vec<TaskIndex> = self.dependents[start].clone();
        while let Some(idx) = stack.pop() {
            let task = &mut self.tasks[idx];
            if task.is_terminal() || task.status == TaskStatus::Running {
                continue;
            }
            task.status = TaskStatus::Skipped;
            task.skip_reason = Some(SkipReason::DependencyFailed {
                task: origin.clone(),
            });
            task.finished_at = Some(at);
            skipped.push(idx);
            stack.extend(self.dependents[idx].iter().copied());
        }
        skipped.sort_unstable();
        skipped.into_iter().map(|i| self.tasks[i].id.clone()).collect()
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(&self) -> Result<(), GraphError> {
        let mut in_degree: Vec<usize> = self.prerequisites.iter().map(|p| p.len()).collect();
        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.tasks.len() {
            // Cross-phase edges only point backwards, so a cycle lives in one phase.
            let involved: Vec<&Task> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| &self.tasks[i])
                .collect();
            let phase = involved[0].phase.clone();
            let tasks = involved
                .iter()
                .filter(|t| t.phase == phase)
                .map(|t| t.id.clone())
                .collect();
            return Err(GraphError::Cycle { phase, tasks });
        }
        Ok(())
    }
}
