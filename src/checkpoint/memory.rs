//! In-memory checkpoint store for tests and embedding.

use super::{Checkpoint, CheckpointStore, Recovered};
use crate::errors::StoreError;
use crate::model::RunId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Records are kept as encoded JSON so loads go through the same
/// deserialization path as the file store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<RunId, BTreeMap<u64, String>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records written for a run.
    pub fn record_count(&self, run: &RunId) -> usize {
        self.runs
            .lock()
            .map(|runs| runs.get(run).map_or(0, |r| r.len()))
            .unwrap_or(0)
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, run: &RunId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(checkpoint).map_err(StoreError::Encode)?;
        let mut runs = self.runs.lock().map_err(|_| Self::poisoned())?;
        let records = runs.entry(run.clone()).or_default();
        if records.contains_key(&checkpoint.seq) {
            return Err(StoreError::SequenceExists {
                run: run.clone(),
                seq: checkpoint.seq,
            });
        }
        records.insert(checkpoint.seq, encoded);
        Ok(())
    }

    async fn load(&self, run: &RunId) -> Result<Option<Recovered>, StoreError> {
        let checkpoints = {
            let runs = self.runs.lock().map_err(|_| Self::poisoned())?;
            let Some(records) = runs.get(run) else {
                return Ok(None);
            };
            records
                .values()
                .map(|encoded| {
                    serde_json::from_str::<Checkpoint>(encoded).map_err(|e| StoreError::Corrupt {
                        path: run.as_str().into(),
                        message: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        Recovered::from_checkpoints(run, checkpoints)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        let runs = self.runs.lock().map_err(|_| Self::poisoned())?;
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointRecord;
    use crate::graph::TaskGraph;
    use crate::model::Run;
    use chrono::Utc;

    #[tokio::test]
    async fn test_memory_store_refuses_overwrite() {
        let store = MemoryCheckpointStore::new();
        let run = Run::new(RunId::new("r"), "", vec![], TaskGraph::new());
        let checkpoint = Checkpoint {
            seq: 0,
            written_at: Utc::now(),
            record: CheckpointRecord::Snapshot {
                run: Box::new(run.clone()),
            },
        };

        store.save(&run.id, &checkpoint).await.unwrap();
        assert!(store.save(&run.id, &checkpoint).await.is_err());
        assert_eq!(store.record_count(&run.id), 1);
        assert_eq!(store.list_runs().await.unwrap(), vec![run.id.clone()]);
    }
}
