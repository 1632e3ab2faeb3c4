//! File-backed checkpoint store: one JSON file per sequence number.
//!
//! Layout: `<root>/<run_id>/<seq>.json`, where `seq` is zero-padded so the
//! directory listing sorts in log order. A record is written to a temporary
//! file and hard-linked into place, which fails if the sequence number is
//! already taken and never exposes a half-written record.

use super::{Checkpoint, CheckpointStore, Recovered};
use crate::errors::StoreError;
use crate::model::RunId;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Name of the marker file another process writes to request cancellation.
pub const CANCEL_MARKER: &str = "cancel";

pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one run's records.
    pub fn run_dir(&self, run: &RunId) -> PathBuf {
        self.root.join(run.as_str())
    }

    pub fn cancel_marker(&self, run: &RunId) -> PathBuf {
        self.run_dir(run).join(CANCEL_MARKER)
    }

    fn record_path(&self, run: &RunId, seq: u64) -> PathBuf {
        self.run_dir(run).join(format!("{:020}.json", seq))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, run: &RunId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let dir = self.run_dir(run);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let path = self.record_path(run, checkpoint.seq);
        if fs::try_exists(&path).await.map_err(|e| io_error(&path, e))? {
            return Err(StoreError::SequenceExists {
                run: run.clone(),
                seq: checkpoint.seq,
            });
        }

        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(StoreError::Encode)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await.map_err(|e| io_error(&tmp, e))?;
        file.write_all(&bytes).await.map_err(|e| io_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
        drop(file);

        let linked = fs::hard_link(&tmp, &path).await;
        // The temporary file is useless either way.
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StoreError::SequenceExists {
                run: run.clone(),
                seq: checkpoint.seq,
            }),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn load(&self, run: &RunId) -> Result<Option<Recovered>, StoreError> {
        let dir = self.run_dir(run);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = fs::read(&path).await.map_err(|e| io_error(&path, e))?;
            let checkpoint: Checkpoint =
                serde_json::from_slice(&content).map_err(|e| StoreError::Corrupt {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            checkpoints.push(checkpoint);
        }

        Recovered::from_checkpoints(run, checkpoints)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.root, e)),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir && let Some(name) = entry.file_name().to_str() {
                runs.push(RunId::new(name));
            }
        }
        runs.sort();
        Ok(runs)
    }
}
