//! Inspecting and controlling stored runs: `status`, `cancel`, `list`, `validate`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use conductor::RunStatusView;
use conductor::config::{CONDUCTOR_DIR, ConductorConfig, ConductorToml};
use conductor::model::{PhaseStatus, RunId, RunSpec, RunState};

use super::build_conductor;

pub async fn cmd_status(config: &ConductorConfig, run_id: &str, json: bool) -> Result<()> {
    let (conductor, _) = build_conductor(config)?;
    let view = conductor
        .status(&RunId::new(run_id))
        .await
        .with_context(|| format!("Failed to read run {}", run_id))?;
    print_status(&view, json)
}

pub async fn cmd_cancel(config: &ConductorConfig, run_id: &str, force: bool) -> Result<()> {
    let (conductor, store) = build_conductor(config)?;
    let id = RunId::new(run_id);
    let view = conductor
        .status(&id)
        .await
        .with_context(|| format!("Failed to read run {}", run_id))?;

    if view.state.is_terminal() {
        bail!("Run {} already {}", id, view.state);
    }

    if force {
        conductor.cancel(&id).await?;
        println!("{} Run {} aborted", style("✓").green(), style(&id).cyan());
        return Ok(());
    }

    let marker = store.cancel_marker(&id);
    std::fs::write(&marker, b"")
        .with_context(|| format!("Failed to write cancel marker {}", marker.display()))?;
    println!(
        "Cancellation requested for run {}. It stops once in-flight tasks return.",
        style(&id).cyan()
    );
    println!(
        "{}",
        style("If no process is driving the run, use --force to abort it.").dim()
    );
    Ok(())
}

pub async fn cmd_list(config: &ConductorConfig, json: bool) -> Result<()> {
    let (conductor, _) = build_conductor(config)?;
    let views = conductor.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if views.is_empty() {
        println!("No runs found in {}", config.runs_dir().display());
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:<14} {:>9}  {}",
        style("RUN").bold(),
        style("STATE").bold(),
        style("PHASE").bold(),
        style("TASKS").bold(),
        style("CREATED").bold()
    );
    for view in &views {
        let totals = &view.report.totals;
        println!(
            "{:<38} {:<16} {:<14} {:>9}  {}",
            view.id.as_str(),
            view.state.as_str(),
            view.current_phase.as_ref().map(|p| p.as_str()).unwrap_or("-"),
            format!("{}/{}", totals.succeeded, totals.total()),
            view.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Check a spec against the project's validation rules without running it.
pub fn cmd_validate(project_dir: &Path, spec_path: &Path) -> Result<()> {
    let toml = ConductorToml::load_or_default(&project_dir.join(CONDUCTOR_DIR))?;
    let spec = RunSpec::load(spec_path)?;

    match spec.validate(&toml.validation) {
        Ok(()) => {
            println!(
                "{} {} is valid: {} phases, {} tasks",
                style("✓").green().bold(),
                spec_path.display(),
                spec.phases.len(),
                spec.task_count()
            );
            Ok(())
        }
        Err(err) => {
            println!("{} {}", style("✗").red().bold(), spec_path.display());
            for problem in &err.problems {
                println!("  - {}", problem);
            }
            bail!("Run spec has {} problem(s)", err.problems.len())
        }
    }
}

fn phase_status_label(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Pending => "pending",
        PhaseStatus::Active => "active",
        PhaseStatus::Gated => "gated",
        PhaseStatus::Approved => "approved",
        PhaseStatus::Rejected => "rejected",
    }
}

/// Print a run status, either for humans or as pretty JSON.
pub fn print_status(view: &RunStatusView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(view)?);
        return Ok(());
    }

    let state = match view.state {
        RunState::Completed => style(view.state.to_string()).green().bold(),
        RunState::Failed => style(view.state.to_string()).red().bold(),
        RunState::Aborted => style(view.state.to_string()).yellow().bold(),
        _ => style(view.state.to_string()).cyan().bold(),
    };

    println!();
    println!("Run {}  {}", style(&view.id).cyan(), view.title);
    println!("  State:   {}{}", state, if view.active { " (active)" } else { "" });
    if let Some(phase) = &view.current_phase {
        println!("  Phase:   {}", phase);
    }
    let totals = &view.report.totals;
    println!(
        "  Tasks:   {}/{} succeeded, {} failed, {} skipped ({:.0}%)",
        totals.succeeded,
        totals.total(),
        totals.failed,
        totals.skipped,
        view.report.success_rate()
    );
    println!("  Revisions: {}", view.report.revision_rounds());
    if let Some(ms) = view.report.duration_ms {
        println!("  Duration: {:.1}s", ms as f64 / 1000.0);
    }

    if let Some(failure) = &view.failure {
        let phase = failure
            .phase
            .as_ref()
            .map(|p| format!(" in {}", p))
            .unwrap_or_default();
        println!(
            "  {} {}{}: {}",
            style("Failure:").red(),
            failure.cause,
            phase,
            failure.reason
        );
        if !failure.tasks.is_empty() {
            let tasks: Vec<&str> = failure.tasks.iter().map(|t| t.as_str()).collect();
            println!("           tasks: {}", tasks.join(", "));
        }
    }

    if !view.report.phases.is_empty() {
        println!();
        println!("  Phases:");
        for phase in &view.report.phases {
            println!(
                "    {:<16} {:<15} {:<9} {}/{} rounds={}",
                phase.id.as_str(),
                phase.kind.as_str(),
                phase_status_label(phase.status),
                phase.counts.succeeded,
                phase.counts.total(),
                phase.revision_rounds
            );
        }
    }

    if !view.report.roles.is_empty() {
        println!();
        println!("  Roles:");
        for (role, stats) in &view.report.roles {
            let avg = stats
                .avg_duration_ms
                .map(|ms| format!(" avg {}ms", ms))
                .unwrap_or_default();
            println!(
                "    {:<16} {} tasks, {} ok, {} failed, {} skipped, {} tries{}",
                role.as_str(),
                stats.tasks,
                stats.succeeded,
                stats.failed,
                stats.skipped,
                stats.tries,
                avg
            );
        }
    }
    println!();
    Ok(())
}
