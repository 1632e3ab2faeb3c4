//! CLI command implementations.
//!
//! | Module   | Commands handled                      |
//! |----------|---------------------------------------|
//! | `run`    | `Run`, `Resume`                       |
//! | `runs`   | `Status`, `Cancel`, `List`, `Validate`|
//! | `config` | `Config`                              |

pub mod config;
pub mod run;
pub mod runs;

pub use config::cmd_config;
pub use run::{cmd_resume, cmd_run};
pub use runs::{cmd_cancel, cmd_list, cmd_status, cmd_validate};

use anyhow::Result;
use conductor::checkpoint::FileCheckpointStore;
use conductor::config::ConductorConfig;
use conductor::dispatch::Dispatcher;
use conductor::{Conductor, ConductorOptions};
use std::sync::Arc;

/// Build a conductor backed by the project's run directory.
pub fn build_conductor(config: &ConductorConfig) -> Result<(Conductor, Arc<FileCheckpointStore>)> {
    let store = Arc::new(FileCheckpointStore::new(config.runs_dir()));
    let dispatcher = Dispatcher::new(config.worker_registry()?, config.dispatch_config());
    let options = ConductorOptions {
        max_concurrency: config.max_concurrency(),
        snapshot_every: config.toml.snapshot_every,
        checkpoint_retry: config.toml.checkpoint_retry.clone(),
        spec_rules: config.spec_rules().clone(),
    };
    let conductor = Conductor::new(
        store.clone(),
        Arc::new(dispatcher),
        config.gate_evaluator(),
        options,
    );
    Ok((conductor, store))
}
