//! Configuration view and validation commands, `conductor config`.

use anyhow::{Context, Result};
use console::style;

use conductor::config::{CONDUCTOR_DIR, CONFIG_FILE, ConductorConfig, ConductorToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let config_path = conductor_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ConductorToml::load(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration:");
                ConductorToml::default()
            };
            println!();
            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            let config = ConductorConfig::new(project_dir.to_path_buf())?;
            println!("  max_concurrency = {}", config.max_concurrency());
            println!("  log_level = \"{}\"", config.log_level());
            println!("  runs_dir = \"{}\"", config.runs_dir().display());
            println!();

            if !config_path.exists() {
                println!("Run 'conductor config init' to create a {} file.", CONFIG_FILE);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let warnings = ConductorToml::load(&config_path)?.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid.", style("✓").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                anyhow::bail!(
                    "{} already exists at {}. Delete it first to recreate it.",
                    CONFIG_FILE,
                    config_path.display()
                );
            }

            std::fs::create_dir_all(&conductor_dir).with_context(|| {
                format!("Failed to create directory: {}", conductor_dir.display())
            })?;
            ConductorToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - max_concurrency, retry and per_role_timeout_secs");
            println!("  - [gate_thresholds] and [gates.<kind>] for phase gates");
            println!("  - [workers.<role>] command lines, or [workers.default]");
            println!();
        }
    }

    Ok(())
}
