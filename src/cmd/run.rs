//! Driving runs in the foreground: `conductor run` and `conductor resume`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use conductor::Conductor;
use conductor::checkpoint::FileCheckpointStore;
use conductor::config::ConductorConfig;
use conductor::model::{GateDecision, RunId, RunSpec, RunState, TaskStatus};
use conductor::scheduler::ProgressEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::build_conductor;
use super::runs::print_status;

/// How often a foreground run checks for a cancel marker.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn cmd_run(config: &ConductorConfig, spec_path: &Path, json: bool) -> Result<()> {
    let spec = RunSpec::load(spec_path)?;
    warn_config(config);

    let (conductor, store, display) = attach(config, json)?;
    let run_id = conductor
        .start(&spec)
        .await
        .with_context(|| format!("Failed to start run from {}", spec_path.display()))?;
    if !json {
        println!(
            "{} {} ({} phases, {} tasks)",
            style("Started run").bold(),
            style(&run_id).cyan(),
            spec.phases.len(),
            spec.task_count()
        );
    }

    follow(conductor, store, run_id, display, json).await
}

pub async fn cmd_resume(config: &ConductorConfig, run_id: &str, json: bool) -> Result<()> {
    warn_config(config);
    let run_id = RunId::new(run_id);

    let (conductor, store, display) = attach(config, json)?;
    conductor
        .resume(&run_id)
        .await
        .with_context(|| format!("Failed to resume run {}", run_id))?;
    if !json {
        println!("{} {}", style("Resumed run").bold(), style(&run_id).cyan());
    }

    follow(conductor, store, run_id, display, json).await
}

fn warn_config(config: &ConductorConfig) {
    for warning in config.validate() {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }
}

type Attached = (Arc<Conductor>, Arc<FileCheckpointStore>, Option<JoinHandle<()>>);

/// Build the conductor, with a progress printer unless output is JSON.
fn attach(config: &ConductorConfig, json: bool) -> Result<Attached> {
    let (conductor, store) = build_conductor(config)?;
    if json {
        return Ok((Arc::new(conductor), store, None));
    }
    let (tx, rx) = mpsc::channel(256);
    let display = tokio::spawn(display_progress(rx));
    Ok((Arc::new(conductor.with_event_channel(tx)), store, Some(display)))
}

/// Wait for the run, cancelling it on Ctrl-C or when a cancel marker appears.
async fn follow(
    conductor: Arc<Conductor>,
    store: Arc<FileCheckpointStore>,
    run_id: RunId,
    display: Option<JoinHandle<()>>,
    json: bool,
) -> Result<()> {
    let marker = store.cancel_marker(&run_id);
    let watcher = tokio::spawn({
        let conductor = conductor.clone();
        let run_id = run_id.clone();
        let marker = marker.clone();
        async move {
            let mut interval = tokio::time::interval(CANCEL_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if marker.exists() {
                            info!(run_id = %run_id, "Cancel marker found");
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!(run_id = %run_id, "Interrupted");
                        break;
                    }
                }
            }
            conductor.cancel(&run_id).await.ok();
        }
    });

    let view = conductor.wait(&run_id).await?;
    watcher.abort();
    if let Some(display) = display {
        tokio::time::timeout(Duration::from_secs(1), display).await.ok();
    }
    let _ = std::fs::remove_file(&marker);

    print_status(&view, json)?;
    if view.state != RunState::Completed {
        anyhow::bail!("Run {} finished {}", view.id, view.state);
    }
    Ok(())
}

async fn display_progress(mut rx: mpsc::Receiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        let finished = matches!(event, ProgressEvent::RunFinished { .. });
        print_event(&event);
        if finished {
            break;
        }
    }
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::PhaseStarted { phase, round } => {
            if *round == 0 {
                println!("{} {}", style("▶ Phase").bold(), style(phase).cyan());
            } else {
                println!(
                    "{} {} {}",
                    style("▶ Phase").bold(),
                    style(phase).cyan(),
                    style(format!("(revision {})", round)).yellow()
                );
            }
        }
        ProgressEvent::TaskDispatched { task, attempt } => {
            println!("  {} {} {}", style("→").dim(), task, style(format!("attempt {}", attempt)).dim());
        }
        ProgressEvent::TaskFinished { task, status, tries } => match status {
            TaskStatus::Succeeded => {
                println!("  {} {} {}", style("✓").green(), task, style(format!("{} tries", tries)).dim())
            }
            _ => println!("  {} {} {}", style("✗").red(), task, style(status).red()),
        },
        ProgressEvent::TasksSkipped { tasks } => {
            let names: Vec<&str> = tasks.iter().map(|t| t.as_str()).collect();
            println!("  {} skipped: {}", style("⊘").yellow(), names.join(", "));
        }
        ProgressEvent::PhaseFinished { result } => {
            println!(
                "  {} {} succeeded, {} failed, {} skipped in {:.1}s",
                style("■").dim(),
                result.counts.succeeded,
                result.counts.failed,
                result.counts.skipped,
                result.duration.as_secs_f64()
            );
        }
        ProgressEvent::GateDecided { phase, decision } => match decision {
            GateDecision::Approve => println!("  {} gate approved {}", style("✓").green().bold(), phase),
            GateDecision::Revise { reason, .. } => {
                println!("  {} revise {}: {}", style("↻").yellow().bold(), phase, reason)
            }
            GateDecision::Reject { reason } => {
                println!("  {} rejected {}: {}", style("✗").red().bold(), phase, reason)
            }
        },
        ProgressEvent::RunFinished { run, state } => {
            let state = match state {
                RunState::Completed => style(state.to_string()).green().bold(),
                RunState::Aborted => style(state.to_string()).yellow().bold(),
                _ => style(state.to_string()).red().bold(),
            };
            println!("{} {} {}", style("Run").bold(), run, state);
        }
    }
}
