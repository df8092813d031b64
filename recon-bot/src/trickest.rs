//! Workflow client backed by the `trickest-cli` command-line tool
//!
//! The CLI is the only integration surface with the platform. Triggering a
//! run renders the scope into the tool's YAML execute config and scrapes the
//! human-readable success line for the run id; status queries parse the
//! tool's `--json` output; outputs are fetched one node at a time.
//!
//! Every invocation runs under the configured timeout and the child process is
//! killed if the timeout fires.

use recon_bot_sdk::{
    async_trait, ClientError, NodeFailure, OutputReport, RunStatusSnapshot, Scope, ScopeField,
    TriggerOutcome, WorkflowClient,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::TrickestConfig;

/// Line printed by `trickest-cli execute` when a run was created
pub const SUCCESS_MARKER: &str = "Run successfully created!";

const UNKNOWN: &str = "Unknown";

/// `trickest-cli` wrapper implementing [`WorkflowClient`]
pub struct TrickestClient {
    config: TrickestConfig,
}

impl TrickestClient {
    pub fn new(config: TrickestConfig) -> Self {
        Self { config }
    }

    /// Command for `subcommand` with authentication applied and pipes set up
    fn base_command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg(subcommand)
            .arg("--token")
            .arg(&self.config.token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the tool to completion under the configured timeout.
    ///
    /// `label` is used for logs and errors; it never contains the token.
    async fn run_tool(&self, mut cmd: Command, subcommand: &str) -> Result<Output, ClientError> {
        let label = format!("{} {}", self.config.binary.display(), subcommand);
        let timeout = self.config.tool_timeout();

        debug!(command = %label, ?timeout, "invoking workflow tool");

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(ClientError::Spawn {
                command: label,
                source,
            }),
            Err(_) => Err(ClientError::Timeout {
                command: label,
                timeout,
            }),
        }
    }
}

#[async_trait]
impl WorkflowClient for TrickestClient {
    async fn trigger(&self, scope: &Scope) -> Result<TriggerOutcome, ClientError> {
        let rendered = render_execute_config(scope, &self.config.inputs)?;

        // Removed when dropped at the end of this call
        let mut config_file = tempfile::Builder::new()
            .prefix("trickest-execute-")
            .suffix(".yaml")
            .tempfile()?;
        config_file.write_all(rendered.as_bytes())?;
        config_file.flush()?;

        let mut cmd = self.base_command("execute");
        cmd.arg("--machines")
            .arg(self.config.machines.to_string())
            .arg("--url")
            .arg(self.config.workflow_url())
            .arg("--config")
            .arg(config_file.path());

        let output = self.run_tool(cmd, "execute").await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let outcome = extract_run_id(&stdout);

        match &outcome {
            TriggerOutcome::Created(run_id) => info!(run_id = %run_id, "workflow run created"),
            TriggerOutcome::NotFound => warn!(
                status = %output.status,
                stderr = %excerpt(&output.stderr),
                "no run id in trigger output"
            ),
        }

        Ok(outcome)
    }

    async fn fetch_status(&self, run_id: &str) -> Result<RunStatusSnapshot, ClientError> {
        let mut cmd = self.base_command("get");
        cmd.arg("--url").arg(self.config.run_url(run_id)).arg("--json");

        let output = self.run_tool(cmd, "get").await?;
        if !output.status.success() {
            debug!(
                run_id,
                status = %output.status,
                stderr = %excerpt(&output.stderr),
                "status query exited unsuccessfully"
            );
        }

        parse_status(&String::from_utf8_lossy(&output.stdout), run_id)
    }

    async fn fetch_outputs(
        &self,
        run_id: &str,
        destination: &Path,
    ) -> Result<OutputReport, ClientError> {
        tokio::fs::create_dir_all(destination).await?;

        let mut report = OutputReport::new(destination);

        for node in &self.config.output_nodes {
            let mut cmd = self.base_command("output");
            cmd.arg("--url")
                .arg(self.config.run_url(run_id))
                .arg("--node")
                .arg(node)
                .arg("--output-dir")
                .arg(destination);

            let reason = match self.run_tool(cmd, "output").await {
                Ok(output) if output.status.success() => {
                    report.fetched.push(node.clone());
                    continue;
                }
                Ok(output) => format!(
                    "exited with {}: {}",
                    output.status,
                    excerpt(&output.stderr)
                ),
                Err(e) => e.to_string(),
            };

            warn!(run_id, node = %node, %reason, "failed to fetch output node");
            report.failed.push(NodeFailure {
                node: node.clone(),
                reason,
            });
        }

        Ok(report)
    }
}

#[derive(Serialize)]
struct ExecuteConfig<'a> {
    inputs: BTreeMap<&'a str, &'a str>,
}

/// Render the YAML execute config binding scope fields to workflow inputs
pub fn render_execute_config(
    scope: &Scope,
    bindings: &BTreeMap<String, ScopeField>,
) -> Result<String, ClientError> {
    let config = ExecuteConfig {
        inputs: bindings
            .iter()
            .map(|(node, field)| (node.as_str(), scope.get(*field)))
            .collect(),
    };
    serde_yaml::to_string(&config).map_err(|e| ClientError::Config(e.to_string()))
}

/// Scrape the run id from `trickest-cli execute` output.
///
/// The first line containing [`SUCCESS_MARKER`] and a non-empty `ID:` suffix
/// wins; anything else is [`TriggerOutcome::NotFound`].
pub fn extract_run_id(output: &str) -> TriggerOutcome {
    output
        .lines()
        .filter(|line| line.contains(SUCCESS_MARKER))
        .filter_map(|line| line.split_once("ID:"))
        .map(|(_, id)| id.trim())
        .find(|id| !id.is_empty())
        .map(|id| TriggerOutcome::Created(id.to_string()))
        .unwrap_or(TriggerOutcome::NotFound)
}

#[derive(Debug, Default, Deserialize)]
struct RawStatus {
    id: Option<String>,
    status: Option<String>,
    workflow_name: Option<String>,
    started_date: Option<String>,
    ip_addresses: Option<Vec<String>>,
}

/// Parse `trickest-cli get --json` output, defaulting absent fields
pub fn parse_status(output: &str, run_id: &str) -> Result<RunStatusSnapshot, ClientError> {
    let raw: RawStatus =
        serde_json::from_str(output.trim()).map_err(|source| ClientError::StatusParse {
            run_id: run_id.to_string(),
            source,
        })?;

    Ok(RunStatusSnapshot {
        run_id: raw.id.unwrap_or_else(|| run_id.to_string()),
        status: raw.status.unwrap_or_else(|| UNKNOWN.to_string()),
        workflow_name: raw.workflow_name.unwrap_or_else(|| UNKNOWN.to_string()),
        started_date: raw.started_date.unwrap_or_else(|| UNKNOWN.to_string()),
        ip_addresses: raw.ip_addresses.unwrap_or_default(),
    })
}

/// First 200 characters of tool stderr, for logs
fn excerpt(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim()
        .chars()
        .take(200)
        .collect()
}
