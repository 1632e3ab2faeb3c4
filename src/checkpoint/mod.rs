//! Durable, append-only record of run progress.
//!
//! A run's checkpoint log is a sequence of immutable records keyed by a
//! per-run sequence number. A record is either a full `Snapshot` of the run
//! or a single `RunEvent`. Recovery loads the latest snapshot and re-applies
//! every later event through `Run::apply`.

mod file;
mod memory;

pub use file::{CANCEL_MARKER, FileCheckpointStore};
pub use memory::MemoryCheckpointStore;

use crate::errors::{RunError, StoreError};
use crate::model::{Applied, Run, RunEvent, RunId};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Payload of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointRecord {
    Snapshot { run: Box<Run> },
    Event { event: RunEvent },
}

/// One immutable checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u64,
    pub written_at: DateTime<Utc>,
    pub record: CheckpointRecord,
}

/// Latest snapshot plus the events written after it.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub snapshot_seq: u64,
    pub snapshot: Run,
    /// `(seq, event)` in sequence order
    pub events: Vec<(u64, RunEvent)>,
}

impl Recovered {
    /// Build from the records of one run, in any order.
    pub(crate) fn from_checkpoints(
        run: &RunId,
        mut checkpoints: Vec<Checkpoint>,
    ) -> Result<Option<Self>, StoreError> {
        if checkpoints.is_empty() {
            return Ok(None);
        }
        checkpoints.sort_by_key(|c| c.seq);

        let snapshot_pos = checkpoints
            .iter()
            .rposition(|c| matches!(c.record, CheckpointRecord::Snapshot { .. }))
            .ok_or_else(|| StoreError::Corrupt {
                path: run.as_str().into(),
                message: "no snapshot in checkpoint log".to_string(),
            })?;

        let mut tail = checkpoints.split_off(snapshot_pos).into_iter();
        let (snapshot_seq, snapshot) = match tail.next() {
            Some(Checkpoint {
                seq,
                record: CheckpointRecord::Snapshot { run: snapshot },
                ..
            }) => (seq, snapshot),
            _ => {
                return Err(StoreError::Corrupt {
                    path: run.as_str().into(),
                    message: "no snapshot in checkpoint log".to_string(),
                });
            }
        };

        let mut expected = snapshot_seq + 1;
        let mut events = Vec::new();
        for checkpoint in tail {
            if checkpoint.seq != expected {
                return Err(StoreError::Corrupt {
                    path: run.as_str().into(),
                    message: format!("gap in checkpoint log: expected {}, found {}", expected, checkpoint.seq),
                });
            }
            expected += 1;
            if let CheckpointRecord::Event { event } = checkpoint.record {
                events.push((checkpoint.seq, event));
            }
        }

        Ok(Some(Self {
            snapshot_seq,
            snapshot: *snapshot,
            events,
        }))
    }

    /// Sequence number of the last record.
    pub fn last_seq(&self) -> u64 {
        self.events.last().map(|(seq, _)| *seq).unwrap_or(self.snapshot_seq)
    }

    /// Re-apply the events onto the snapshot.
    pub fn replay(self) -> Result<(Run, u64), RunError> {
        let last_seq = self.last_seq();
        let mut run = self.snapshot;
        for (seq, event) in &self.events {
            debug!(run_id = %run.id, seq, event = event.kind(), "Replaying checkpoint");
            run.apply(event)?;
        }
        Ok((run, last_seq))
    }
}

/// Storage backend for checkpoints.
///
/// `save` must refuse to overwrite an existing sequence number.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, run: &RunId, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Latest snapshot and replay log, or `None` for an unknown run.
    async fn load(&self, run: &RunId) -> Result<Option<Recovered>, StoreError>;

    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError>;
}

/// Writes a run's checkpoints in application order.
///
/// Every applied event is written; a full snapshot follows every
/// `snapshot_every` events and every phase boundary. Store errors are retried
/// per `retry`, then surface as `RunError::Infrastructure`.
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    run_id: RunId,
    next_seq: u64,
    events_since_snapshot: u32,
    snapshot_every: u32,
    retry: RetryPolicy,
}

impl Checkpointer {
    /// Writer for a fresh run; the first record gets sequence number 0.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        run_id: RunId,
        snapshot_every: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            run_id,
            next_seq: 0,
            events_since_snapshot: 0,
            snapshot_every: snapshot_every.max(1),
            retry,
        }
    }

    /// Writer continuing after a recovered log.
    pub fn resume_after(mut self, last_seq: u64) -> Self {
        self.next_seq = last_seq + 1;
        self
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Apply `event` to `run`, then persist it.
    pub async fn commit(&mut self, run: &mut Run, event: RunEvent) -> Result<Applied, RunError> {
        let applied = run.apply(&event)?;
        self.record(run, &event).await?;
        Ok(applied)
    }

    /// Persist an event that has just been applied to `run`.
    pub async fn record(&mut self, run: &Run, event: &RunEvent) -> Result<(), RunError> {
        self.write(CheckpointRecord::Event {
            event: event.clone(),
        })
        .await?;
        self.events_since_snapshot += 1;

        if event.is_phase_boundary() || self.events_since_snapshot >= self.snapshot_every {
            self.snapshot(run).await?;
        }
        Ok(())
    }

    /// Persist a full snapshot of `run`.
    pub async fn snapshot(&mut self, run: &Run) -> Result<(), RunError> {
        self.write(CheckpointRecord::Snapshot {
            run: Box::new(run.clone()),
        })
        .await?;
        self.events_since_snapshot = 0;
        Ok(())
    }

    async fn write(&mut self, record: CheckpointRecord) -> Result<(), RunError> {
        let checkpoint = Checkpoint {
            seq: self.next_seq,
            written_at: Utc::now(),
            record,
        };

        let attempts = self.retry.attempts();
        let mut tries = 0;
        loop {
            tries += 1;
            match self.store.save(&self.run_id, &checkpoint).await {
                Ok(()) => break,
                Err(e @ StoreError::SequenceExists { .. }) => {
                    return Err(RunError::Infrastructure {
                        attempts: tries,
                        source: e,
                    });
                }
                Err(e) if tries >= attempts => {
                    return Err(RunError::Infrastructure {
                        attempts: tries,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_after(tries);
                    warn!(
                        run_id = %self.run_id,
                        seq = checkpoint.seq,
                        attempt = tries,
                        error = %e,
                        "Checkpoint write failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        debug!(run_id = %self.run_id, seq = checkpoint.seq, "Checkpoint written");
        self.next_seq += 1;
        Ok(())
    }
}
