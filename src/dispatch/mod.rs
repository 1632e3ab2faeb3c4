//! Worker dispatch: hands a task to a worker and normalizes the outcome.
//!
//! Roles are plain data. A `WorkerRegistry` maps each role to a `Worker`
//! implementation; the `Dispatcher` applies timeout, retry and cancellation
//! uniformly and never interprets task semantics. Worker failures are
//! `Outcome` values, never errors.

mod process;

pub use process::ProcessWorker;

use crate::cancel::CancelSignal;
use crate::model::{AttemptToken, PhaseId, Role, RunId, Task, TaskId};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Everything a worker receives for one try.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Deduplication key, stable across recovery
    pub token: AttemptToken,
    pub run: RunId,
    pub task: TaskId,
    pub phase: PhaseId,
    pub role: Role,
    pub attempt: u32,
    pub try_number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Results of the task's prerequisites
    #[serde(default)]
    pub context: BTreeMap<TaskId, Value>,
}

/// Typed worker failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// Worth retrying
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying cannot help
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// An external capability that executes tasks of some role.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, request: WorkRequest) -> Result<Value, WorkerError>;

    /// Best-effort cancellation of an in-flight call.
    async fn cancel(&self, _token: &AttemptToken) {}
}

/// Role tag to worker mapping.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<Role, Arc<dyn Worker>>,
    fallback: Option<Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, role: impl Into<Role>, worker: Arc<dyn Worker>) -> &mut Self {
        self.workers.insert(role.into(), worker);
        self
    }

    pub fn with_worker(mut self, role: impl Into<Role>, worker: Arc<dyn Worker>) -> Self {
        self.register(role, worker);
        self
    }

    /// Worker used for roles without a dedicated registration.
    pub fn with_fallback(mut self, worker: Arc<dyn Worker>) -> Self {
        self.fallback = Some(worker);
        self
    }

    pub fn get(&self, role: &Role) -> Option<Arc<dyn Worker>> {
        self.workers.get(role).or(self.fallback.as_ref()).cloned()
    }

    pub fn roles(&self) -> Vec<&Role> {
        let mut roles: Vec<&Role> = self.workers.keys().collect();
        roles.sort();
        roles
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient worker failure (a single try)
    Worker,
    Permanent,
    RetriesExhausted,
    NoWorker,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Worker => "worker",
            Self::Permanent => "permanent",
            Self::RetriesExhausted => "retries_exhausted",
            Self::NoWorker => "no_worker",
        };
        f.write_str(s)
    }
}

/// Outcome of a try, or of a whole dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { result: Value },
    Failure { kind: FailureKind, message: String },
    Timeout,
    Cancelled,
}

impl Outcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Whether another try may help.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Failure {
                    kind: FailureKind::Worker,
                    ..
                }
        )
    }
}

/// One try of a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryRecord {
    pub token: AttemptToken,
    pub outcome: Outcome,
    pub duration_ms: u64,
}

/// Final outcome of a dispatch plus every try.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub task: TaskId,
    pub attempt: u32,
    pub outcome: Outcome,
    pub tries: Vec<TryRecord>,
}

impl DispatchReport {
    pub fn try_count(&self) -> u32 {
        self.tries.len() as u32
    }
}

/// Timeout, retry and cancellation settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    pub default_timeout: Duration,
    pub per_role_timeout: HashMap<Role, Duration>,
    /// How long a cancelled call may take to wind down before it is dropped
    pub cancel_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_timeout: Duration::from_secs(600),
            per_role_timeout: HashMap::new(),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

impl DispatchConfig {
    pub fn timeout_for(&self, role: &Role) -> Duration {
        self.per_role_timeout
            .get(role)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

pub struct Dispatcher {
    registry: WorkerRegistry,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: WorkerRegistry, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Run a task to a final outcome, retrying per policy.
    ///
    /// Try `n` of attempt `a` always carries token `run/task/a<a>/t<n>`.
    pub async fn dispatch(
        &self,
        run: &RunId,
        task: &Task,
        timeout: Duration,
        context: BTreeMap<TaskId, Value>,
        cancel: &CancelSignal,
    ) -> DispatchReport {
        let mut report = DispatchReport {
            task: task.id.clone(),
            attempt: task.attempt,
            outcome: Outcome::Cancelled,
            tries: Vec::new(),
        };

        let Some(worker) = self.registry.get(&task.role) else {
            warn!(run_id = %run, task = %task.id, role = %task.role, "No worker registered for role");
            report.outcome = Outcome::failure(
                FailureKind::NoWorker,
                format!("no worker registered for role '{}'", task.role),
            );
            return report;
        };

        let attempts = self.config.retry.attempts();
        for try_number in 1..=attempts {
            if cancel.is_cancelled() {
                report.outcome = Outcome::Cancelled;
                return report;
            }

            let token = AttemptToken::new(run, &task.id, task.attempt, try_number);
            let request = WorkRequest {
                token: token.clone(),
                run: run.clone(),
                task: task.id.clone(),
                phase: task.phase.clone(),
                role: task.role.clone(),
                attempt: task.attempt,
                try_number,
                title: task.title.clone(),
                payload: task.payload.clone(),
                success_criteria: task.success_criteria.clone(),
                context: context.clone(),
            };

            debug!(run_id = %run, task = %task.id, token = %token, "Dispatching");
            let started = Instant::now();
            let outcome = self
                .try_once(worker.as_ref(), request, &token, timeout, cancel)
                .await;
            report.tries.push(TryRecord {
                token: token.clone(),
                outcome: outcome.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            });

            if !outcome.is_retryable() {
                report.outcome = outcome;
                return report;
            }

            let message = match &outcome {
                Outcome::Failure { message, .. } => message.clone(),
                _ => format!("timed out after {:?}", timeout),
            };
            if try_number == attempts {
                info!(
                    run_id = %run,
                    task = %task.id,
                    attempt = task.attempt,
                    tries = try_number,
                    "Retry budget exhausted"
                );
                report.outcome = Outcome::failure(FailureKind::RetriesExhausted, message);
                return report;
            }

            let delay = self.config.retry.delay_after(try_number);
            warn!(
                run_id = %run,
                task = %task.id,
                attempt = task.attempt,
                try_number,
                error = %message,
                "Try failed, retrying in {:?}",
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    report.outcome = Outcome::Cancelled;
                    return report;
                }
            }
        }

        report
    }

    async fn try_once(
        &self,
        worker: &dyn Worker,
        request: WorkRequest,
        token: &AttemptToken,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Outcome {
        let mut call = worker.execute(request);

        let finished = tokio::select! {
            res = tokio::time::timeout(timeout, &mut call) => Some(res),
            _ = cancel.cancelled() => None,
        };

        match finished {
            Some(Ok(Ok(result))) => Outcome::Success { result },
            Some(Ok(Err(WorkerError::Transient(message)))) => {
                Outcome::failure(FailureKind::Worker, message)
            }
            Some(Ok(Err(WorkerError::Permanent(message)))) => {
                Outcome::failure(FailureKind::Permanent, message)
            }
            Some(Err(_elapsed)) => {
                worker.cancel(token).await;
                Outcome::Timeout
            }
            None => {
                worker.cancel(token).await;
                if tokio::time::timeout(self.config.cancel_grace, &mut call)
                    .await
                    .is_err()
                {
                    warn!(token = %token, "Worker did not stop within grace period, dropping call");
                }
                Outcome::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails transiently `failures` times, then succeeds. Records tokens.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        tokens: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                tokens: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Worker for Flaky {
        async fn execute(&self, request: WorkRequest) -> Result<Value, WorkerError> {
            self.tokens.lock().unwrap().push(request.token.to_string());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(WorkerError::Transient(format!("flake {}", n + 1)))
            } else {
                Ok(serde_json::json!({"calls": n + 1}))
            }
        }
    }

    struct Permanent;

    #[async_trait]
    impl Worker for Permanent {
        async fn execute(&self, _request: WorkRequest) -> Result<Value, WorkerError> {
            Err(WorkerError::Permanent("bad input".into()))
        }
    }

    /// Never returns; counts cancel calls.
    struct Stuck {
        cancels: AtomicU32,
    }

    #[async_trait]
    impl Worker for Stuck {
        async fn execute(&self, _request: WorkRequest) -> Result<Value, WorkerError> {
            std::future::pending().await
        }

        async fn cancel(&self, _token: &AttemptToken) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max_attempts: u32) -> DispatchConfig {
        DispatchConfig {
            retry: RetryPolicy::fixed(max_attempts, Duration::from_millis(1)),
            default_timeout: Duration::from_secs(5),
            per_role_timeout: HashMap::new(),
            cancel_grace: Duration::from_millis(20),
        }
    }

    fn task() -> Task {
        Task::new("B", "impl", "coder")
    }

    #[tokio::test]
    async fn test_retries_transient_failures_until_success() {
        let worker = Arc::new(Flaky::new(2));
        let dispatcher = Dispatcher::new(
            WorkerRegistry::new().with_worker("coder", worker.clone()),
            config(3),
        );

        let report = dispatcher
            .dispatch(
                &RunId::new("r"),
                &task(),
                Duration::from_secs(1),
                BTreeMap::new(),
                &CancelSignal::never(),
            )
            .await;

        assert!(report.outcome.is_success());
        assert_eq!(report.try_count(), 3);
        assert_eq!(
            *worker.tokens.lock().unwrap(),
            vec!["r/B/a1/t1", "r/B/a1/t2", "r/B/a1/t3"]
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_last_message() {
        let dispatcher = Dispatcher::new(
            WorkerRegistry::new().with_worker("coder", Arc::new(Flaky::new(5))),
            config(2),
        );
        let report = dispatcher
            .dispatch(
                &RunId::new("r"),
                &task(),
                Duration::from_secs(1),
                BTreeMap::new(),
                &CancelSignal::never(),
            )
            .await;
        assert_eq!(
            report.outcome,
            Outcome::failure(FailureKind::RetriesExhausted, "flake 2")
        );
        assert_eq!(report.try_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let dispatcher = Dispatcher::new(
            WorkerRegistry::new().with_worker("coder", Arc::new(Permanent)),
            config(3),
        );
        let report = dispatcher
            .dispatch(
                &RunId::new("r"),
                &task(),
                Duration::from_secs(1),
                BTreeMap::new(),
                &CancelSignal::never(),
            )
            .await;
        assert_eq!(report.outcome, Outcome::failure(FailureKind::Permanent, "bad input"));
        assert_eq!(report.try_count(), 1);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_then_exhausted() {
        let worker = Arc::new(Stuck {
            cancels: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(
            WorkerRegistry::new().with_worker("coder", worker.clone()),
            config(2),
        );
        let report = dispatcher
            .dispatch(
                &RunId::new("r"),
                &task(),
                Duration::from_millis(10),
                BTreeMap::new(),
                &CancelSignal::never(),
            )
            .await;
        assert!(matches!(
            report.outcome,
            Outcome::Failure {
                kind: FailureKind::RetriesExhausted,
                ..
            }
        ));
        assert!(report.tries.iter().all(|t| t.outcome == Outcome::Timeout));
        assert_eq!(worker.cancels.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_calls_worker_cancel_and_reports_cancelled() {
        let worker = Arc::new(Stuck {
            cancels: AtomicU32::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            WorkerRegistry::new().with_worker("coder", worker.clone()),
            config(3),
        ));
        let (handle, signal) = cancel_pair();

        let join = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .dispatch(
                        &RunId::new("r"),
                        &task(),
                        Duration::from_secs(30),
                        BTreeMap::new(),
                        &signal,
                    )
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let report = tokio::time::timeout(Duration::from_secs(2), join)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(worker.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_worker_and_fallback() {
        let dispatcher = Dispatcher::new(WorkerRegistry::new(), config(3));
        let report = dispatcher
            .dispatch(
                &RunId::new("r"),
                &task(),
                Duration::from_secs(1),
                BTreeMap::new(),
                &CancelSignal::never(),
            )
            .await;
        assert!(matches!(
            report.outcome,
            Outcome::Failure {
                kind: FailureKind::NoWorker,
                ..
            }
        ));

        let registry = WorkerRegistry::new().with_fallback(Arc::new(Flaky::new(0)));
        assert!(registry.get(&Role::new("anything")).is_some());
    }

    #[test]
    fn test_timeout_per_role() {
        let mut cfg = config(1);
        cfg.per_role_timeout
            .insert(Role::new("planner"), Duration::from_secs(900));
        assert_eq!(cfg.timeout_for(&Role::new("planner")), Duration::from_secs(900));
        assert_eq!(cfg.timeout_for(&Role::new("coder")), Duration::from_secs(5));
    }
}
