use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Phased multi-worker delivery orchestrator")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Maximum concurrent dispatches. Overrides conductor.toml and CONDUCTOR_MAX_CONCURRENCY.
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a run from a spec file and drive it to completion
    Run {
        /// Run spec (.json or .toml)
        spec: PathBuf,
        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Continue an interrupted run from its checkpoints
    Resume {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the status of a run
    Status {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Ask a run to stop
    Cancel {
        run_id: String,
        /// Abort the run in its checkpoint log right away. Only for runs no
        /// process is driving any more.
        #[arg(long)]
        force: bool,
    },
    /// List all runs
    List {
        #[arg(long)]
        json: bool,
    },
    /// Check a run spec without running it
    Validate { spec: PathBuf },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Config { command } => {
            return cmd::cmd_config(&project_dir, command.clone());
        }
        Commands::Validate { spec } => {
            return cmd::cmd_validate(&project_dir, spec);
        }
        _ => {}
    }

    let config = conductor::config::ConductorConfig::new(project_dir)?
        .with_max_concurrency(cli.max_concurrency);
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level()
    };
    conductor::telemetry::init(&level, cli.log_json);

    match &cli.command {
        Commands::Run { spec, json } => cmd::cmd_run(&config, spec, *json).await?,
        Commands::Resume { run_id, json } => cmd::cmd_resume(&config, run_id, *json).await?,
        Commands::Status { run_id, json } => cmd::cmd_status(&config, run_id, *json).await?,
        Commands::Cancel { run_id, force } => cmd::cmd_cancel(&config, run_id, *force).await?,
        Commands::List { json } => cmd::cmd_list(&config, *json).await?,
        Commands::Config { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}
