//! Identifier newtypes shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of one end-to-end run.
    RunId
);
string_id!(
    /// Identifier of a task, unique within a run.
    TaskId
);
string_id!(
    /// Identifier of a phase, unique within a run.
    PhaseId
);
string_id!(
    /// Capability tag naming which kind of worker executes a task.
    Role
);

impl RunId {
    /// Generate a fresh, filesystem-safe run id.
    pub fn generate() -> Self {
        Self(format!("run-{}", Uuid::new_v4().simple()))
    }
}

/// Token carried by every dispatch call so external workers can deduplicate.
///
/// Tokens are deterministic: `run/task/a<attempt>/t<try>`. A task re-dispatched
/// after recovery produces the same sequence of tokens as the interrupted one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptToken(String);

impl AttemptToken {
    pub fn new(run: &RunId, task: &TaskId, attempt: u32, try_number: u32) -> Self {
        Self(format!("{}/{}/a{}/t{}", run, task, attempt, try_number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
