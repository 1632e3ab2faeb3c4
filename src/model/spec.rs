//! Run specs: the input describing phases and tasks, and their validation.

use crate::errors::{GraphError, RunError, ValidationError};
use crate::graph::TaskGraph;
use crate::model::{Phase, PhaseId, PhaseKind, Role, Run, RunId, Task, TaskId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A task as declared in a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub role: Role,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: PhaseId,
    pub kind: PhaseKind,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// Definition of a run: ordered phases, each with its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseSpec>,
}

/// Extra validation rules from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecRules {
    /// When non-empty, every task role must be listed here
    pub allowed_roles: Vec<Role>,
    /// Reject tasks without success criteria
    pub require_success_criteria: bool,
}

impl RunSpec {
    /// Load a spec from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run spec: {}", path.display()))?;
        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        if is_toml {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse run spec TOML: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse run spec JSON: {}", path.display()))
        }
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    /// Validate the run spec, collecting every problem before failing.
    pub fn validate(&self, rules: &SpecRules) -> Result<(), ValidationError> {
        let mut problems = Vec::new();

        if self.phases.is_empty() {
            problems.push("run spec defines no phases".to_string());
        }

        let mut phase_ids = HashSet::new();
        let mut previous_kind: Option<PhaseKind> = None;
        // task id -> index of its phase
        let mut task_phase: HashMap<&TaskId, usize> = HashMap::new();

        for (pi, phase) in self.phases.iter().enumerate() {
            if phase.id.as_str().trim().is_empty() {
                problems.push(format!("phase {}: empty id", pi));
            } else if !phase_ids.insert(&phase.id) {
                problems.push(format!("duplicate phase id '{}'", phase.id));
            }
            if let Some(prev) = previous_kind
                && phase.kind < prev
            {
                problems.push(format!(
                    "phase '{}': {} phase cannot follow a {} phase",
                    phase.id, phase.kind, prev
                ));
            }
            previous_kind = Some(phase.kind);

            for (ti, task) in phase.tasks.iter().enumerate() {
                let prefix = format!("phase '{}', task {}", phase.id, ti);
                if task.id.as_str().trim().is_empty() {
                    problems.push(format!("{}: empty id", prefix));
                } else if task_phase.insert(&task.id, pi).is_some() {
                    problems.push(format!("duplicate task id '{}'", task.id));
                }
                if task.role.as_str().trim().is_empty() {
                    problems.push(format!("{}: empty role", prefix));
                } else if !rules.allowed_roles.is_empty() && !rules.allowed_roles.contains(&task.role) {
                    problems.push(format!(
                        "task '{}': role '{}' is not one of the allowed roles",
                        task.id, task.role
                    ));
                }
                if rules.require_success_criteria && task.success_criteria.is_empty() {
                    problems.push(format!("task '{}': success criteria must be non-empty", task.id));
                }
            }
        }

        let mut edge_problems = false;
        for (pi, phase) in self.phases.iter().enumerate() {
            for task in &phase.tasks {
                for dep in &task.depends_on {
                    match task_phase.get(dep) {
                        None => {
                            edge_problems = true;
                            problems.push(format!(
                                "task '{}': unknown prerequisite '{}'",
                                task.id, dep
                            ));
                        }
                        Some(&dep_phase) if dep_phase > pi => {
                            edge_problems = true;
                            problems.push(format!(
                                "task '{}': prerequisite '{}' is in later phase '{}'",
                                task.id, dep, self.phases[dep_phase].id
                            ));
                        }
                        Some(_) if dep == &task.id => {
                            edge_problems = true;
                            problems.push(format!("task '{}' depends on itself", task.id));
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        // Cycle detection needs a structurally sound graph.
        if !edge_problems
            && problems.is_empty()
            && let Err(e) = self.build_graph()
        {
            problems.push(e.to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(problems))
        }
    }

    /// Validate and build a fresh run.
    pub fn build_run(&self, id: RunId, rules: &SpecRules) -> Result<Run, RunError> {
        self.validate(rules)?;
        let phases = self
            .phases
            .iter()
            .enumerate()
            .map(|(i, p)| Phase::new(p.id.clone(), p.kind, i))
            .collect();
        let graph = self.build_graph()?;
        Ok(Run::new(id, self.title.clone(), phases, graph))
    }

    fn build_graph(&self) -> Result<TaskGraph, GraphError> {
        let phase_ids = self.phases.iter().map(|p| p.id.clone()).collect();
        let tasks = self
            .phases
            .iter()
            .flat_map(|phase| {
                phase.tasks.iter().map(|spec| {
                    Task::new(spec.id.clone(), phase.id.clone(), spec.role.clone())
                        .with_title(&spec.title)
                        .with_depends_on(spec.depends_on.iter().cloned())
                        .with_payload(spec.payload.clone())
                        .with_success_criteria(spec.success_criteria.clone())
                })
            })
            .collect();
        TaskGraph::from_tasks(phase_ids, tasks)
    }
}
