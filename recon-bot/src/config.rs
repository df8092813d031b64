//! Bot configuration
//!
//! Settings are read from a YAML file and then overridden from the environment
//! (a `.env` file is loaded by `main` before this runs). Secrets have no
//! defaults: a config without the shared auth secret, the Telegram token, the
//! Trickest token or the workflow id is rejected at startup.

use anyhow::{bail, Context, Result};
use recon_bot_sdk::ScopeField;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_AUTH_SECRET: &str = "RECON_BOT_AUTH_SECRET";
pub const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_TRICKEST_TOKEN: &str = "TRICKEST_TOKEN";
pub const ENV_TRICKEST_WORKFLOW_ID: &str = "TRICKEST_WORKFLOW_ID";
pub const ENV_DATABASE: &str = "RECON_BOT_DATABASE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Shared secret users present with `/start <secret>`
    pub auth_secret: String,
    pub telegram: TelegramConfig,
    pub trickest: TrickestConfig,
    /// SQLite database holding authorized users and runs
    pub database: PathBuf,
    /// Root directory for downloaded run outputs (`<outputs_dir>/<run_id>`)
    pub outputs_dir: PathBuf,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: String,
    pub api_url: String,
    /// Long-poll timeout passed to `getUpdates`
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrickestConfig {
    pub binary: PathBuf,
    pub token: String,
    pub workflow_id: String,
    pub editor_url: String,
    pub machines: u32,
    pub tool_timeout_secs: u64,
    /// Workflow node input name -> scope field bound to it
    pub inputs: BTreeMap<String, ScopeField>,
    /// Output nodes downloaded for a completed run
    pub output_nodes: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            auth_secret: String::new(),
            telegram: TelegramConfig::default(),
            trickest: TrickestConfig::default(),
            database: data_dir.join("runs.db"),
            outputs_dir: data_dir.join("outputs"),
            poll_interval_secs: 300,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_url: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 30,
        }
    }
}

impl Default for TrickestConfig {
    fn default() -> Self {
        let inputs = [
            ("string-to-file-1.string", ScopeField::Domains),
            ("string-to-file-2.string", ScopeField::Subdomains),
            ("3-0-google-dorks-1.string", ScopeField::Cseid),
            ("string-input-3.string", ScopeField::Ips),
            ("string-input-4.string", ScopeField::IpRanges),
        ]
        .into_iter()
        .map(|(node, field)| (node.to_string(), field))
        .collect();

        let output_nodes = [
            "1-4-domains-json-info-1",
            "1-3-subdomains-json-info-1",
            "cat-all-in-1",
            "4-0-get-initial-urls-1",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            binary: PathBuf::from("trickest-cli"),
            token: String::new(),
            workflow_id: String::new(),
            editor_url: "https://trickest.io/editor".to_string(),
            machines: 4,
            tool_timeout_secs: 120,
            inputs,
            output_nodes,
        }
    }
}

impl TrickestConfig {
    /// Editor URL of the configured workflow
    pub fn workflow_url(&self) -> String {
        format!(
            "{}/{}",
            self.editor_url.trim_end_matches('/'),
            self.workflow_id
        )
    }

    /// Editor URL of a single run of the configured workflow
    pub fn run_url(&self, run_id: &str) -> String {
        format!("{}?run={}", self.workflow_url(), run_id)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl BotConfig {
    /// Load configuration from `path` (or the default location), apply
    /// environment overrides and validate.
    ///
    /// An explicit path must exist. The default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("Failed to parse YAML config")
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty(ENV_AUTH_SECRET) {
            self.auth_secret = v;
        }
        if let Some(v) = non_empty(ENV_TELEGRAM_TOKEN) {
            self.telegram.token = v;
        }
        if let Some(v) = non_empty(ENV_TRICKEST_TOKEN) {
            self.trickest.token = v;
        }
        if let Some(v) = non_empty(ENV_TRICKEST_WORKFLOW_ID) {
            self.trickest.workflow_id = v;
        }
        if let Some(v) = non_empty(ENV_DATABASE) {
            self.database = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth_secret.is_empty() {
            bail!("auth_secret is not set (config file or {})", ENV_AUTH_SECRET);
        }
        if self.telegram.token.is_empty() {
            bail!("telegram.token is not set (config file or {})", ENV_TELEGRAM_TOKEN);
        }
        if self.trickest.token.is_empty() {
            bail!("trickest.token is not set (config file or {})", ENV_TRICKEST_TOKEN);
        }
        if self.trickest.workflow_id.is_empty() {
            bail!(
                "trickest.workflow_id is not set (config file or {})",
                ENV_TRICKEST_WORKFLOW_ID
            );
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "recon-bot")
}

/// `config.yaml` in the platform config directory
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.yaml"))
}
