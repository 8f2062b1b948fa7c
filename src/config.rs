//! Configuration for fixwatch.
//!
//! Settings are read from `.fixwatch/fixwatch.toml` in the project directory
//! and layered as file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:3000"
//!
//! [stream]
//! throttle_rate = 10
//! max_activities = 500
//! max_reconnect_attempts = 5
//! reconnect_delay_ms = 3000
//!
//! [ci]
//! enabled = true
//! interval_ms = 15000
//! max_retries = 40
//! owner = "acme"
//! repo = "payments"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ci::MonitorConfig;
use crate::stream::IngestorConfig;

/// Environment variable that overrides `[server] base_url`.
pub const BASE_URL_ENV: &str = "FIXWATCH_BASE_URL";

/// Name of the per-project configuration directory.
pub const CONFIG_DIR: &str = ".fixwatch";

/// Name of the configuration file inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "fixwatch.toml";

/// Dashboard server location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Base URL of the dashboard API (push stream and CI endpoints)
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Event stream ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    /// Maximum activity-log flushes per second
    #[serde(default = "default_throttle_rate")]
    pub throttle_rate: u32,
    /// Activity log entries retained per subject
    #[serde(default = "default_max_activities")]
    pub max_activities: usize,
    /// Reconnects attempted after a dropped connection before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_throttle_rate() -> u32 {
    10
}

fn default_max_activities() -> usize {
    500
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            throttle_rate: default_throttle_rate(),
            max_activities: default_max_activities(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl StreamSection {
    pub fn to_ingestor_config(&self) -> IngestorConfig {
        IngestorConfig {
            throttle_rate: self.throttle_rate,
            max_activities: self.max_activities,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

/// CI polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiSection {
    /// Whether CI polling may be started at all
    #[serde(default = "default_ci_enabled")]
    pub enabled: bool,
    /// Delay between polls while checks are pending or running
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Polls attempted before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Repository owner; with `repo`, selects the owner/repo status query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

fn default_ci_enabled() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    15_000
}

fn default_max_retries() -> u32 {
    40
}

impl Default for CiSection {
    fn default() -> Self {
        Self {
            enabled: default_ci_enabled(),
            interval_ms: default_interval_ms(),
            max_retries: default_max_retries(),
            owner: None,
            repo: None,
        }
    }
}

impl CiSection {
    pub fn to_monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            enabled: self.enabled,
            interval: Duration::from_millis(self.interval_ms),
            max_retries: self.max_retries,
        }
    }
}

/// The complete fixwatch.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FixwatchToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub ci: CiSection,
}

impl FixwatchToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fixwatch.toml")
    }

    /// Load `fixwatch.toml` from `config_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize fixwatch.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Base URL, with fallback to environment variable.
    pub fn base_url(&self) -> String {
        std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.server.base_url.clone())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = reqwest::Url::parse(&self.server.base_url) {
            warnings.push(format!(
                "Invalid base_url '{}': {}",
                self.server.base_url, e
            ));
        }
        if self.stream.throttle_rate == 0 {
            warnings.push("throttle_rate is 0; treating it as 1 flush per second".to_string());
        } else if self.stream.throttle_rate > 1_000 {
            warnings.push(format!(
                "throttle_rate is {}; flushes are capped at 1000 per second",
                self.stream.throttle_rate
            ));
        }
        if self.stream.max_activities == 0 {
            warnings.push("max_activities is 0; activity logs will always be empty".to_string());
        }
        if self.ci.interval_ms == 0 {
            warnings.push("ci.interval_ms is 0; CI status would be polled in a tight loop".to_string());
        }
        if self.ci.owner.is_some() != self.ci.repo.is_some() {
            warnings.push("ci.owner and ci.repo must be set together; ignoring both".to_string());
        }

        warnings
    }

    /// The `(owner, repo)` pair, only when both are set.
    pub fn owner_repo(&self) -> Option<(String, String)> {
        match (&self.ci.owner, &self.ci.repo) {
            (Some(owner), Some(repo)) => Some((owner.clone(), repo.clone())),
            _ => None,
        }
    }
}

/// Configuration merged from fixwatch.toml, the environment and CLI flags.
#[derive(Debug, Clone)]
pub struct FixwatchConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: FixwatchToml,
    /// CLI override for the server base URL
    pub cli_base_url: Option<String>,
}

impl FixwatchConfig {
    /// Create a new FixwatchConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = FixwatchToml::load_or_default(&config_dir)?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            cli_base_url: None,
        })
    }

    /// Create FixwatchConfig with CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, base_url: Option<String>) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_base_url = base_url;
        Ok(config)
    }

    /// Base URL (CLI → env → file → default).
    pub fn base_url(&self) -> String {
        self.cli_base_url
            .clone()
            .unwrap_or_else(|| self.toml.base_url())
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn ingestor_config(&self) -> IngestorConfig {
        self.toml.stream.to_ingestor_config()
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        self.toml.ci.to_monitor_config()
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
