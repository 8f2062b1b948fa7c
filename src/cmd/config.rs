//! Configuration view and validation commands: `fixwatch config`.

use anyhow::{Context, Result};
use std::path::Path;

use fixwatch::config::{CONFIG_DIR, CONFIG_FILE, FixwatchConfig, FixwatchToml};

use super::super::ConfigCommands;

fn print_sections(toml: &FixwatchToml) {
    println!("[server]");
    println!("  base_url = \"{}\"", toml.server.base_url);
    println!();

    println!("[stream]");
    println!("  throttle_rate = {}", toml.stream.throttle_rate);
    println!("  max_activities = {}", toml.stream.max_activities);
    println!(
        "  max_reconnect_attempts = {}",
        toml.stream.max_reconnect_attempts
    );
    println!("  reconnect_delay_ms = {}", toml.stream.reconnect_delay_ms);
    println!();

    println!("[ci]");
    println!("  enabled = {}", toml.ci.enabled);
    println!("  interval_ms = {}", toml.ci.interval_ms);
    println!("  max_retries = {}", toml.ci.max_retries);
    if let Some(owner) = &toml.ci.owner {
        println!("  owner = \"{}\"", owner);
    }
    if let Some(repo) = &toml.ci.repo {
        println!("  repo = \"{}\"", repo);
    }
    println!();
}

pub fn cmd_config(
    project_dir: &Path,
    base_url: Option<String>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Fixwatch Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_sections(&FixwatchToml::load(&config_path)?);
            } else {
                println!("No fixwatch.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                print_sections(&FixwatchToml::default());
                println!("Run 'fixwatch config init' to create a fixwatch.toml file.");
                println!();
            }

            // Show effective values (including env overrides)
            println!("Effective values (with env/CLI overrides):");
            let config = FixwatchConfig::with_cli_args(project_dir.to_path_buf(), base_url)?;
            println!("  base_url = \"{}\"", config.base_url());
            println!(
                "  min_flush_interval_ms = {}",
                config.ingestor_config().min_flush_interval().as_millis()
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No fixwatch.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = FixwatchToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("fixwatch.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir).with_context(|| {
                format!("Failed to create config directory: {}", config_dir.display())
            })?;

            FixwatchToml::default().save(&config_path)?;

            println!("Created fixwatch.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] base_url");
            println!("  - [stream] throttle_rate, max_activities, reconnect policy");
            println!("  - [ci] interval_ms, max_retries, owner/repo");
            println!();
        }
    }

    Ok(())
}
