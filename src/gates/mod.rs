//! Quality gates between phases.
//!
//! A gate looks at what a phase produced and decides whether the run moves
//! on (`approve`), redoes part of the phase (`revise`), or stops (`reject`).

mod artifacts;

pub use artifacts::{PhaseArtifacts, TaskReport};

use crate::model::{GateDecision, GateRecord, Issue, Phase, PhaseKind, Role, TaskId, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Default number of revise rounds a phase may consume before rejection.
pub const DEFAULT_MAX_REVISION_ROUNDS: u32 = 3;

/// Rules applied to one kind of phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Lowest acceptable score (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<u32>,
    /// Issue categories that block approval
    #[serde(default)]
    pub blocking_categories: Vec<String>,
    /// Result keys each succeeded task of a role must provide
    #[serde(default)]
    pub required_artifacts: BTreeMap<Role, Vec<String>>,
    #[serde(default = "default_max_revision_rounds")]
    pub max_revision_rounds: u32,
}

fn default_max_revision_rounds() -> u32 {
    DEFAULT_MAX_REVISION_ROUNDS
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            min_score: None,
            blocking_categories: Vec::new(),
            required_artifacts: BTreeMap::new(),
            max_revision_rounds: DEFAULT_MAX_REVISION_ROUNDS,
        }
    }
}

impl GatePolicy {
    pub fn with_min_score(mut self, min_score: u32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_max_revision_rounds(mut self, rounds: u32) -> Self {
        self.max_revision_rounds = rounds;
        self
    }

    fn is_blocking(&self, category: &str) -> bool {
        self.blocking_categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }
}

/// Evaluates phases against a policy per phase kind.
#[derive(Debug, Clone, Default)]
pub struct GateEvaluator {
    default: GatePolicy,
    policies: HashMap<PhaseKind, GatePolicy>,
}

impl GateEvaluator {
    pub fn new(default: GatePolicy) -> Self {
        Self {
            default,
            policies: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, kind: PhaseKind, policy: GatePolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn policy_for(&self, kind: PhaseKind) -> &GatePolicy {
        self.policies.get(&kind).unwrap_or(&self.default)
    }

    /// Decide on a gated phase. The returned record is what gets
    /// checkpointed as the gate's evidence.
    pub fn evaluate(&self, phase: &Phase, artifacts: &PhaseArtifacts) -> GateRecord {
        let policy = self.policy_for(phase.kind);
        let score = artifacts.min_score();
        let mut findings = Findings::default();

        for task in &artifacts.failed {
            findings.target(task);
        }
        if !artifacts.failed.is_empty() {
            findings.reasons.push(format!(
                "{} task(s) failed: {}",
                artifacts.failed.len(),
                join_ids(&artifacts.failed)
            ));
        }

        if let (Some(min), Some(threshold)) = (score, policy.min_score)
            && min < threshold
        {
            for report in &artifacts.reports {
                if report.score.is_some_and(|s| s < threshold) {
                    findings.flag(report);
                }
            }
            findings
                .reasons
                .push(format!("score {} below threshold {}", min, threshold));
        }

        for report in &artifacts.reports {
            let blocking: Vec<&Issue> = report
                .issues
                .iter()
                .filter(|i| policy.is_blocking(&i.category))
                .collect();
            if !blocking.is_empty() {
                findings.flag(report);
                findings.blocking.extend(blocking.into_iter().cloned());
            }

            if report.status == TaskStatus::Succeeded {
                let missing: Vec<&String> = policy
                    .required_artifacts
                    .get(&report.role)
                    .map(|keys| keys.iter().filter(|k| !report.keys.contains(*k)).collect())
                    .unwrap_or_default();
                if !missing.is_empty() {
                    findings.flag(report);
                    findings
                        .missing
                        .extend(missing.into_iter().map(|k| format!("{}:{}", report.task, k)));
                }
            }
        }
        if !findings.blocking.is_empty() {
            let categories: BTreeSet<&str> =
                findings.blocking.iter().map(|i| i.category.as_str()).collect();
            findings.reasons.push(format!(
                "blocking issues: {}",
                categories.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        if !findings.missing.is_empty() {
            findings
                .reasons
                .push(format!("missing artifacts: {}", findings.missing.join(", ")));
        }

        let decision = self.decide(phase, policy, artifacts, &findings);
        debug!(
            phase = %phase.id,
            round = phase.revision_rounds,
            score = ?score,
            decision = ?decision,
            "Gate evaluated"
        );
        if !decision.is_approve() {
            info!(phase = %phase.id, reason = decision.reason().unwrap_or(""), "Gate did not approve");
        }

        GateRecord {
            round: phase.revision_rounds,
            decision,
            score,
            threshold: policy.min_score,
            failed_tasks: artifacts.failed.clone(),
            blocking_issues: findings.blocking,
            missing_artifacts: findings.missing,
            decided_at: Utc::now(),
        }
    }

    fn decide(
        &self,
        phase: &Phase,
        policy: &GatePolicy,
        artifacts: &PhaseArtifacts,
        findings: &Findings,
    ) -> GateDecision {
        if findings.reasons.is_empty() {
            return GateDecision::Approve;
        }
        let reason = findings.reasons.join("; ");

        if phase.revision_rounds >= policy.max_revision_rounds {
            return GateDecision::Reject {
                reason: format!(
                    "{} after {} revision round(s)",
                    reason, phase.revision_rounds
                ),
            };
        }

        // Keep phase order and drop ids from other phases.
        let targets: Vec<TaskId> = artifacts
            .reports
            .iter()
            .map(|r| r.task.clone())
            .filter(|id| findings.targets.contains(id))
            .collect();
        if targets.is_empty() {
            return GateDecision::Reject {
                reason: format!("{} (no task of the phase to revise)", reason),
            };
        }
        GateDecision::Revise { reason, targets }
    }
}

#[derive(Default)]
struct Findings {
    targets: BTreeSet<TaskId>,
    reasons: Vec<String>,
    blocking: Vec<Issue>,
    missing: Vec<String>,
}

impl Findings {
    fn target(&mut self, task: &TaskId) {
        self.targets.insert(task.clone());
    }

    /// A flagged reporter is redone together with the tasks it named.
    fn flag(&mut self, report: &TaskReport) {
        self.target(&report.task);
        for task in &report.revise {
            self.target(task);
        }
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PhaseId;
    use serde_json::{Value, json};

    fn report(task: &str, role: &str, result: Value) -> TaskReport {
        let object = result.as_object().cloned().unwrap_or_default();
        TaskReport {
            task: TaskId::new(task),
            role: Role::new(role),
            status: TaskStatus::Succeeded,
            score: object.get("score").and_then(Value::as_u64).map(|s| s as u32),
            issues: object
                .get("issues")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .map(|i| Issue {
                            category: i["category"].as_str().unwrap_or_default().to_string(),
                            message: String::new(),
                            task: Some(TaskId::new(task)),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            revise: object
                .get("revise")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(TaskId::from).collect())
                .unwrap_or_default(),
            keys: object.keys().cloned().collect(),
        }
    }

    fn planning(rounds: u32) -> Phase {
        let mut phase = Phase::new("plan", PhaseKind::Planning, 0);
        phase.revision_rounds = rounds;
        phase
    }

    fn evaluator() -> GateEvaluator {
        GateEvaluator::default().with_policy(
            PhaseKind::Planning,
            GatePolicy {
                blocking_categories: vec!["security".into()],
                required_artifacts: BTreeMap::from([(Role::new("planner"), vec!["plan".into()])]),
                ..GatePolicy::default().with_min_score(70)
            },
        )
    }

    fn artifacts(reports: Vec<TaskReport>) -> PhaseArtifacts {
        PhaseArtifacts {
            reports,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_phase_is_approved() {
        let record = evaluator().evaluate(&planning(0), &PhaseArtifacts::default());
        assert_eq!(record.decision, GateDecision::Approve);
        assert_eq!(record.score, None);
    }

    #[test]
    fn test_low_score_revises_reporter() {
        let arts = artifacts(vec![
            report("P1", "planner", json!({"plan": "v1", "score": 60})),
            report("P2", "planner", json!({"plan": "v1", "score": 90})),
        ]);
        let record = evaluator().evaluate(&planning(0), &arts);

        match record.decision {
            GateDecision::Revise { reason, targets } => {
                assert_eq!(targets, vec![TaskId::new("P1")]);
                assert!(reason.contains("score 60 below threshold 70"));
            }
            other => panic!("Expected revise, got {:?}", other),
        }
        assert_eq!(record.score, Some(60));
        assert_eq!(record.threshold, Some(70));
    }

    #[test]
    fn test_score_at_threshold_approves() {
        let arts = artifacts(vec![report("P1", "planner", json!({"plan": "v2", "score": 70}))]);
        assert!(evaluator().evaluate(&planning(1), &arts).decision.is_approve());
    }

    #[test]
    fn test_reviewer_revise_list_targets_reviewed_tasks_too() {
        let arts = artifacts(vec![
            report("P1", "planner", json!({"plan": "v1"})),
            report("P2", "planner", json!({"plan": "v1"})),
            report(
                "R1",
                "reviewer",
                json!({"score": 50, "revise": ["P2", "X9"]}),
            ),
        ]);
        match evaluator().evaluate(&planning(0), &arts).decision {
            GateDecision::Revise { targets, .. } => {
                assert_eq!(targets, vec![TaskId::new("P2"), TaskId::new("R1")]);
            }
            other => panic!("Expected revise, got {:?}", other),
        }
    }

    #[test]
    fn test_blocking_issue_and_missing_artifact() {
        let arts = artifacts(vec![
            report("P1", "planner", json!({"notes": "no plan key"})),
            report(
                "R1",
                "reviewer",
                json!({"issues": [{"category": "Security"}, {"category": "style"}]}),
            ),
        ]);
        let record = evaluator().evaluate(&planning(0), &arts);

        assert_eq!(record.blocking_issues.len(), 1);
        assert_eq!(record.missing_artifacts, vec!["P1:plan"]);
        match record.decision {
            GateDecision::Revise { reason, targets } => {
                assert_eq!(targets, vec![TaskId::new("P1"), TaskId::new("R1")]);
                assert!(reason.contains("blocking issues: Security"));
                assert!(reason.contains("missing artifacts: P1:plan"));
            }
            other => panic!("Expected revise, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_tasks_are_revised() {
        let mut arts = artifacts(vec![report("P1", "planner", json!({"plan": "v1"}))]);
        arts.reports[0].status = TaskStatus::Failed;
        arts.reports[0].keys.clear();
        arts.failed = vec![TaskId::new("P1")];

        let record = evaluator().evaluate(&planning(0), &arts);
        assert_eq!(record.failed_tasks, vec![TaskId::new("P1")]);
        match record.decision {
            GateDecision::Revise { targets, .. } => assert_eq!(targets, vec![TaskId::new("P1")]),
            other => panic!("Expected revise, got {:?}", other),
        }
        // Failed tasks have no artifacts to check
        assert!(record.missing_artifacts.is_empty());
    }

    #[test]
    fn test_revision_cap_turns_revise_into_reject() {
        let arts = artifacts(vec![report("P1", "planner", json!({"plan": "v4", "score": 10}))]);
        let record = evaluator().evaluate(&planning(DEFAULT_MAX_REVISION_ROUNDS), &arts);
        assert!(record.decision.is_reject());
        assert!(record.decision.reason().unwrap().contains("after 3 revision round(s)"));
    }

    #[test]
    fn test_unconfigured_kind_uses_default_policy() {
        let qa = Phase::new(PhaseId::new("qa"), PhaseKind::Qa, 2);
        let arts = artifacts(vec![report("Q1", "tester", json!({"score": 5}))]);
        assert!(evaluator().evaluate(&qa, &arts).decision.is_approve());
    }
}
