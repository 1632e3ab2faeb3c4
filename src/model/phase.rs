//! Phase: an ordered, gated stage of a run.

use crate::model::{GateRecord, PhaseId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a phase is for. Determines gate policy lookup and controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Planning,
    Implementation,
    Qa,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Qa => "qa",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planning" => Ok(Self::Planning),
            "implementation" => Ok(Self::Implementation),
            "qa" => Ok(Self::Qa),
            _ => Err(format!(
                "Invalid phase kind '{}'. Valid values: planning, implementation, qa",
                s
            )),
        }
    }
}

/// Status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    /// Tasks are being scheduled
    Active,
    /// All tasks terminal, awaiting a gate decision
    Gated,
    Approved,
    Rejected,
}

impl PhaseStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

/// A phase and its gate history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhaseId,
    pub kind: PhaseKind,
    /// Position in the run, starting at 0
    pub index: usize,
    #[serde(default)]
    pub status: PhaseStatus,
    /// Revise decisions applied so far
    #[serde(default)]
    pub revision_rounds: u32,
    #[serde(default)]
    pub gate_records: Vec<GateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn new(id: impl Into<PhaseId>, kind: PhaseKind, index: usize) -> Self {
        Self {
            id: id.into(),
            kind,
            index,
            status: PhaseStatus::Pending,
            revision_rounds: 0,
            gate_records: Vec::new(),
            activated_at: None,
            closed_at: None,
        }
    }

    /// The most recent gate record, if the phase was evaluated.
    pub fn last_gate(&self) -> Option<&GateRecord> {
        self.gate_records.last()
    }
}
