//! Shared types for recon-bot
//!
//! Everything that crosses the boundary between the chat front end, the run
//! store and the external workflow platform lives here: the scope a user
//! submits, the run record kept locally, the live status snapshot reported by
//! the platform, and the two narrow traits ([`WorkflowClient`] and
//! [`Notifier`]) the application is wired through.

// Re-export async trait for convenience
pub use async_trait::async_trait;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Chat identity (Telegram chat id) of a bot user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub i64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Identity {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Targeting parameters submitted for a run.
///
/// Every field is either empty (nothing supplied) or a comma separated list
/// with all whitespace removed. Use [`Scope::set`] to store a raw answer so
/// the normalisation is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub domains: String,
    pub subdomains: String,
    pub initial_urls: String,
    pub ips: String,
    pub ip_ranges: String,
    pub cseid: String,
    pub github_names: String,
}

/// Names a single [`Scope`] field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeField {
    Domains,
    Subdomains,
    InitialUrls,
    Ips,
    IpRanges,
    Cseid,
    GithubNames,
}

impl ScopeField {
    /// Fields in the order they are collected from the user
    pub const ALL: [ScopeField; 7] = [
        ScopeField::Domains,
        ScopeField::Subdomains,
        ScopeField::InitialUrls,
        ScopeField::Ips,
        ScopeField::IpRanges,
        ScopeField::Cseid,
        ScopeField::GithubNames,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ScopeField::Domains => "domains",
            ScopeField::Subdomains => "subdomains",
            ScopeField::InitialUrls => "initial_urls",
            ScopeField::Ips => "ips",
            ScopeField::IpRanges => "ip_ranges",
            ScopeField::Cseid => "cseid",
            ScopeField::GithubNames => "github_names",
        }
    }
}

impl Scope {
    pub fn get(&self, field: ScopeField) -> &str {
        match field {
            ScopeField::Domains => &self.domains,
            ScopeField::Subdomains => &self.subdomains,
            ScopeField::InitialUrls => &self.initial_urls,
            ScopeField::Ips => &self.ips,
            ScopeField::IpRanges => &self.ip_ranges,
            ScopeField::Cseid => &self.cseid,
            ScopeField::GithubNames => &self.github_names,
        }
    }

    /// Store a raw user answer for `field`, normalised with [`normalize_answer`]
    pub fn set(&mut self, field: ScopeField, raw: &str) {
        let slot = match field {
            ScopeField::Domains => &mut self.domains,
            ScopeField::Subdomains => &mut self.subdomains,
            ScopeField::InitialUrls => &mut self.initial_urls,
            ScopeField::Ips => &mut self.ips,
            ScopeField::IpRanges => &mut self.ip_ranges,
            ScopeField::Cseid => &mut self.cseid,
            ScopeField::GithubNames => &mut self.github_names,
        };
        *slot = normalize_answer(raw);
    }

    /// True when no field was supplied
    pub fn is_empty(&self) -> bool {
        ScopeField::ALL.iter().all(|f| self.get(*f).is_empty())
    }
}

/// Normalise a free-text scope answer.
///
/// Answers of two characters or fewer (after trimming) mean "none" and become
/// the empty string, so `n`, `no` and `-` all skip a field. Anything longer has
/// every whitespace character removed.
pub fn normalize_answer(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= 2 {
        return String::new();
    }
    trimmed.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Locally tracked run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "Pending",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending)
    }

    /// Only Pending runs may move, and only to a terminal state
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(self, RunStatus::Pending) && next.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run status: {0}")]
pub struct UnknownRunStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(RunStatus::Pending),
            "Completed" => Ok(RunStatus::Completed),
            "Failed" => Ok(RunStatus::Failed),
            other => Err(UnknownRunStatus(other.to_string())),
        }
    }
}

/// One triggered workflow execution as recorded locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub identity: Identity,
    pub run_id: String,
    pub name: String,
    pub created_at: NaiveDate,
    pub status: RunStatus,
    pub parameters: Scope,
}

/// Live answer from the platform for a single run. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusSnapshot {
    pub run_id: String,
    pub status: String,
    pub workflow_name: String,
    pub started_date: String,
    pub ip_addresses: Vec<String>,
}

impl RunStatusSnapshot {
    pub fn reported_state(&self) -> ReportedState {
        ReportedState::classify(&self.status)
    }
}

/// Case-insensitive reading of a platform status string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportedState {
    Completed,
    Unknown,
    Other(String),
}

impl ReportedState {
    pub fn classify(status: &str) -> Self {
        let status = status.trim();
        if status.eq_ignore_ascii_case("completed") {
            ReportedState::Completed
        } else if status.eq_ignore_ascii_case("unknown") {
            ReportedState::Unknown
        } else {
            ReportedState::Other(status.to_string())
        }
    }
}

/// Result of scraping the trigger output for a run id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Created(String),
    NotFound,
}

impl TriggerOutcome {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            TriggerOutcome::Created(id) => Some(id),
            TriggerOutcome::NotFound => None,
        }
    }
}

/// A single output node that could not be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node: String,
    pub reason: String,
}

/// Outcome of fetching every output node of a run into one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputReport {
    pub destination: PathBuf,
    pub fetched: Vec<String>,
    pub failed: Vec<NodeFailure>,
}

impl OutputReport {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            fetched: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Errors raised while talking to the workflow platform
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("status output for run {run_id} is not valid JSON: {source}")]
    StatusParse {
        run_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to render execute config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for notification delivery
pub type NotifyResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The only bridge to the external workflow platform.
///
/// Implementations are free to shell out to a CLI or call an HTTP API; callers
/// only see run ids, snapshots and output reports.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Launch a run for `scope`
    async fn trigger(&self, scope: &Scope) -> Result<TriggerOutcome, ClientError>;

    /// Fetch the current status of a run
    async fn fetch_status(&self, run_id: &str) -> Result<RunStatusSnapshot, ClientError>;

    /// Download every configured output node of a run into `destination`
    async fn fetch_outputs(
        &self,
        run_id: &str,
        destination: &Path,
    ) -> Result<OutputReport, ClientError>;
}

/// Pushes a text message to a chat identity
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, identity: Identity, text: &str) -> NotifyResult;
}
