//! Worker that runs an external command per try.
//!
//! The request is written to the child's stdin as JSON. The child answers
//! with one JSON line on stdout (the last non-empty line is used):
//!
//! ```text
//! {"status":"success","result":{...}}
//! {"status":"failure","retryable":true,"message":"..."}
//! ```
//!
//! The attempt token is also exported as `CONDUCTOR_ATTEMPT_TOKEN`.

use super::{WorkRequest, Worker, WorkerError};
use crate::model::AttemptToken;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Reply {
    Success {
        #[serde(default)]
        result: Value,
    },
    Failure {
        #[serde(default)]
        retryable: bool,
        #[serde(default)]
        message: String,
    },
}

pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    /// In-flight calls by token, for cancellation
    running: Mutex<HashMap<AttemptToken, Arc<Notify>>>,
}

impl ProcessWorker {
    /// `command[0]` is the program, the rest are its arguments.
    pub fn new(command: &[String]) -> Result<Self, WorkerError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| WorkerError::Permanent("empty worker command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Register an in-flight call. The entry is removed when the guard drops,
    /// including when a timeout drops the call future.
    fn track(&self, token: &AttemptToken) -> Tracked<'_> {
        let stop = Arc::new(Notify::new());
        if let Ok(mut running) = self.running.lock() {
            running.insert(token.clone(), stop.clone());
        }
        Tracked {
            running: &self.running,
            token: token.clone(),
            stop,
        }
    }

    async fn run(&self, request: &WorkRequest, stop: &Notify) -> Result<Value, WorkerError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| WorkerError::Permanent(format!("failed to encode request: {}", e)))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("CONDUCTOR_ATTEMPT_TOKEN", request.token.as_str())
            .env("CONDUCTOR_TASK_ID", request.task.as_str())
            .env("CONDUCTOR_ROLE", request.role.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Permanent(format!("failed to spawn '{}': {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that ignores its input may close stdin early.
            if let Err(e) = stdin.write_all(&input).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(WorkerError::Transient(format!("failed to write request: {}", e)));
            }
        }

        // Dropping the wait future kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| WorkerError::Transient(format!("failed to wait for worker: {}", e)))?,
            _ = stop.notified() => {
                return Err(WorkerError::Transient("cancelled".to_string()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<Reply>(line.trim()));

        match reply {
            Some(Ok(Reply::Success { result })) => Ok(result),
            Some(Ok(Reply::Failure { retryable: true, message })) => Err(WorkerError::Transient(message)),
            Some(Ok(Reply::Failure { message, .. })) => Err(WorkerError::Permanent(message)),
            _ if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(WorkerError::Transient(format!(
                    "worker exited with {}: {}",
                    output.status,
                    stderr.trim()
                )))
            }
            Some(Err(e)) => Err(WorkerError::Permanent(format!("malformed worker reply: {}", e))),
            None => Err(WorkerError::Permanent("worker produced no reply".to_string())),
        }
    }
}

struct Tracked<'a> {
    running: &'a Mutex<HashMap<AttemptToken, Arc<Notify>>>,
    token: AttemptToken,
    stop: Arc<Notify>,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.token);
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn execute(&self, request: WorkRequest) -> Result<Value, WorkerError> {
        debug!(token = %request.token, program = %self.program, "Spawning worker process");
        let tracked = self.track(&request.token);
        self.run(&request, &tracked.stop).await
    }

    async fn cancel(&self, token: &AttemptToken) {
        let notify = self
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(token).cloned());
        if let Some(notify) = notify {
            notify.notify_one();
        }
    }
}
