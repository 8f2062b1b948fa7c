use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fixwatch::config::FixwatchConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "fixwatch")]
#[command(version, about = "Live monitor for remediation runs and their CI")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Dashboard server URL. Overrides FIXWATCH_BASE_URL and fixwatch.toml.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow the live event stream of one or more runs
    Stream {
        /// Comma-separated subject ids
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<String>,
    },
    /// Poll CI for a commit until it finishes
    Ci {
        #[arg(long)]
        branch: String,

        #[arg(long)]
        sha: String,

        /// Request an automated fix for this run if checks fail
        #[arg(long, value_name = "SUBJECT")]
        auto_fix: Option<String>,
    },
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
    /// Validate configuration file
    Validate,
    /// Create default fixwatch.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    fixwatch::telemetry::init_tracing(cli.verbose, cli.log_json)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Stream { ids } => {
            let config = FixwatchConfig::with_cli_args(project_dir, cli.base_url.clone())?;
            cmd::cmd_stream(&config, ids).await?;
        }
        Commands::Ci {
            branch,
            sha,
            auto_fix,
        } => {
            let config = FixwatchConfig::with_cli_args(project_dir, cli.base_url.clone())?;
            cmd::cmd_ci(&config, branch, sha, auto_fix.as_deref()).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.base_url.clone(), command.clone())?
        }
    }

    Ok(())
}
