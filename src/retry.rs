//! Retry policy: attempt budget and backoff delays.
//!
//! Shared by the worker dispatcher and the checkpoint writer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay between tries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },
    /// `base_ms * multiplier^(try - 1)`, capped at `max_ms`.
    Exponential {
        #[serde(default = "default_delay_ms")]
        base_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
    },
}

fn default_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    30_000
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_ms: default_delay_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
        }
    }
}

/// Retry policy for a fallible operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries including the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// A single try, no retries.
    pub fn none() -> Self {
        Self::new(1, Backoff::Fixed { delay_ms: 0 })
    }

    /// Fixed delay between tries.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(
            max_attempts,
            Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        )
    }

    /// Effective attempt budget; zero is treated as one try.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the `tries`-th failed try (1-indexed).
    pub fn delay_after(&self, tries: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                base_ms,
                multiplier,
                max_ms,
            } => {
                let exp = tries.saturating_sub(1).min(63) as i32;
                let millis = (*base_ms as f64) * multiplier.powi(exp);
                let capped = millis.min(*max_ms as f64).max(0.0);
                Duration::from_millis(capped as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_backoff_increases_and_caps() {
        let policy = RetryPolicy::new(
            10,
            Backoff::Exponential {
                base_ms: 100,
                multiplier: 2.0,
                max_ms: 1_000,
            },
        );
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(policy.delay_after(1), policy.delay_after(3));
    }

    #[test]
    fn test_zero_attempts_means_one_try() {
        let policy = RetryPolicy::new(0, Backoff::default());
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: RetryPolicy = toml::from_str(
            r#"
max_attempts = 5
[backoff]
kind = "fixed"
delay_ms = 10
"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff, Backoff::Fixed { delay_ms: 10 });
    }
}
