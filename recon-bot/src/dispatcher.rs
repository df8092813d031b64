//! Routes chat input to the service and the scope form
//!
//! The dispatcher is transport-agnostic: it turns an [`Incoming`] event into
//! a list of [`Reply`] values, and the Telegram loop delivers them.

use recon_bot_sdk::{Identity, RunStatusSnapshot};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

use crate::conversation::{confirmation_summary, ConversationError, Conversations, FormStep};
use crate::service::{ReconService, ServiceError};

pub const MSG_AUTH_OK: &str = "Authorization successful!";
pub const MSG_AUTH_FAILED: &str = "Authorization failed.";
pub const MSG_NOT_AUTHORIZED: &str = "You are not authorized to use this command.";
pub const MSG_NOT_AUTHORIZED_RUN: &str = "You are not authorized to view this run.";
pub const MSG_TRIGGER_FAILED: &str = "Failed to trigger workflow.";
pub const MSG_CANCELLED: &str = "Operation cancelled.";
pub const MSG_NO_RUNS: &str = "No runs found for your user ID.";
pub const MSG_SELECT_RUN: &str = "Select a run to view details:";
pub const MSG_STATUS_FAILED: &str = "Failed to fetch run status.";
pub const MSG_HISTORY_FAILED: &str = "Failed to load your run history.";

/// One event from the chat transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text {
        identity: Identity,
        text: String,
    },
    /// Inline keyboard press; `data` carries a run id
    Callback {
        identity: Identity,
        message_id: Option<i64>,
        data: String,
    },
    /// Any message without text (stickers, photos, files)
    Other { identity: Identity },
}

/// Something to send back to the identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Telegram HTML parse mode
    Html(String),
    /// Text with one button per row as (label, callback data)
    Keyboard {
        text: String,
        buttons: Vec<(String, String)>,
    },
    /// Replace the text of the message the callback came from
    Edit { message_id: i64, text: String },
    Document(PathBuf),
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }
}

pub struct Dispatcher {
    service: Arc<ReconService>,
    conversations: Conversations,
}

impl Dispatcher {
    pub fn new(service: Arc<ReconService>) -> Self {
        Self {
            service,
            conversations: Conversations::new(),
        }
    }

    pub async fn route(&self, incoming: Incoming) -> Vec<Reply> {
        match incoming {
            Incoming::Text { identity, text } => match parse_command(&text) {
                Some((command, args)) => self.handle_command(identity, command, args).await,
                None => self.handle_answer(identity, &text).await,
            },
            Incoming::Callback {
                identity,
                message_id,
                data,
            } => self.handle_run_selected(identity, message_id, &data).await,
            Incoming::Other { identity } => match self.conversations.current_prompt(identity) {
                Some(prompt) => vec![Reply::text(format!(
                    "Please answer with a text message.\n{}",
                    prompt
                ))],
                None => Vec::new(),
            },
        }
    }

    async fn handle_command(&self, identity: Identity, command: &str, args: &str) -> Vec<Reply> {
        match command {
            "start" => match self.service.authorize(identity, args.trim()) {
                Ok(()) => vec![Reply::text(MSG_AUTH_OK)],
                Err(ServiceError::Unauthorized) => vec![Reply::text(MSG_AUTH_FAILED)],
                Err(e) => {
                    error!(%identity, error = %e, "authorization failed");
                    vec![Reply::text(MSG_AUTH_FAILED)]
                }
            },
            "analyze" => self.handle_analyze(identity),
            "last_status" => self.handle_last_status(identity).await,
            "history" => self.handle_history(identity),
            "cancel" => {
                if self.conversations.cancel(identity) {
                    vec![Reply::text(MSG_CANCELLED)]
                } else {
                    vec![Reply::text("Nothing to cancel.")]
                }
            }
            _ => match self.conversations.current_prompt(identity) {
                Some(prompt) => vec![Reply::text(format!(
                    "Please answer the current question or send /cancel.\n{}",
                    prompt
                ))],
                None => vec![Reply::text(
                    "Unknown command. Available: /start, /analyze, /last_status, /history, /cancel",
                )],
            },
        }
    }

    fn handle_analyze(&self, identity: Identity) -> Vec<Reply> {
        match self.service.is_authorized(identity) {
            Ok(true) => {}
            Ok(false) => return vec![Reply::text(MSG_NOT_AUTHORIZED)],
            Err(e) => {
                error!(%identity, error = %e, "authorization check failed");
                return vec![Reply::text(MSG_NOT_AUTHORIZED)];
            }
        }

        match self.conversations.begin(identity) {
            Ok(prompt) => vec![Reply::text(prompt)],
            Err(_) => {
                let prompt = self.conversations.current_prompt(identity).unwrap_or_default();
                vec![Reply::text(format!(
                    "An analysis is already in progress. Answer the current question or send /cancel.\n{}",
                    prompt
                ))]
            }
        }
    }

    async fn handle_answer(&self, identity: Identity, text: &str) -> Vec<Reply> {
        let step = match self.conversations.handle(identity, text) {
            Ok(step) => step,
            // Free text outside a form is ignored
            Err(ConversationError::NotActive) => return Vec::new(),
            Err(e) => {
                warn!(%identity, error = %e, "unexpected form state");
                return Vec::new();
            }
        };

        match step {
            FormStep::Prompt(prompt) => vec![Reply::text(prompt)],
            FormStep::Confirm(scope) => vec![Reply::Html(format!(
                "Please confirm the following data:\n<pre>{}</pre>\nType 'yes' to confirm or 'no' to cancel.",
                escape_html(&confirmation_summary(&scope))
            ))],
            FormStep::Cancelled => vec![Reply::text(MSG_CANCELLED)],
            FormStep::Confirmed { name, scope } => {
                match self.service.trigger(identity, &name, &scope).await {
                    Ok(run_id) => vec![Reply::text(format!(
                        "Workflow triggered. Run ID: {}",
                        run_id
                    ))],
                    Err(ServiceError::Unauthorized) => vec![Reply::text(MSG_NOT_AUTHORIZED)],
                    Err(ServiceError::TriggerFailed) => vec![Reply::text(MSG_TRIGGER_FAILED)],
                    Err(e) => {
                        error!(%identity, error = %e, "trigger failed");
                        vec![Reply::text(MSG_TRIGGER_FAILED)]
                    }
                }
            }
        }
    }

    async fn handle_last_status(&self, identity: Identity) -> Vec<Reply> {
        match self.service.status(identity).await {
            Ok(Some(snapshot)) => vec![Reply::text(format_status(&snapshot))],
            Ok(None) => vec![Reply::text(MSG_NO_RUNS)],
            Err(ServiceError::Unauthorized) => vec![Reply::text(MSG_NOT_AUTHORIZED)],
            Err(e) => {
                error!(%identity, error = %e, "status lookup failed");
                vec![Reply::text(MSG_STATUS_FAILED)]
            }
        }
    }

    fn handle_history(&self, identity: Identity) -> Vec<Reply> {
        match self.service.history(identity) {
            Ok(runs) if runs.is_empty() => vec![Reply::text(MSG_NO_RUNS)],
            Ok(runs) => vec![Reply::Keyboard {
                text: MSG_SELECT_RUN.to_string(),
                buttons: runs
                    .into_iter()
                    .map(|run| {
                        (
                            format!("{} - {}", run.name, run.created_at.format("%d/%m/%y")),
                            run.run_id,
                        )
                    })
                    .collect(),
            }],
            Err(ServiceError::Unauthorized) => vec![Reply::text(MSG_NOT_AUTHORIZED)],
            Err(e) => {
                error!(%identity, error = %e, "history lookup failed");
                vec![Reply::text(MSG_HISTORY_FAILED)]
            }
        }
    }

    async fn handle_run_selected(
        &self,
        identity: Identity,
        message_id: Option<i64>,
        run_id: &str,
    ) -> Vec<Reply> {
        let show = |text: String| match message_id {
            Some(message_id) => Reply::Edit { message_id, text },
            None => Reply::Text(text),
        };

        let snapshot = match self.service.run_details(identity, run_id).await {
            Ok(snapshot) => snapshot,
            Err(ServiceError::Unauthorized) => {
                return vec![show(MSG_NOT_AUTHORIZED_RUN.to_string())]
            }
            Err(ServiceError::RunNotFound(_)) => return vec![show("Run not found.".to_string())],
            Err(e) => {
                error!(%identity, run_id, error = %e, "run details lookup failed");
                return vec![show(MSG_STATUS_FAILED.to_string())];
            }
        };

        let mut replies = vec![show(format_status(&snapshot))];
        if snapshot.reported_state() != recon_bot_sdk::ReportedState::Completed {
            return replies;
        }

        match self.service.download_outputs(identity, run_id, &snapshot).await {
            Ok(downloaded) => {
                replies.extend(downloaded.files.into_iter().map(Reply::Document));
                if !downloaded.report.is_complete() {
                    let nodes: Vec<&str> = downloaded
                        .report
                        .failed
                        .iter()
                        .map(|f| f.node.as_str())
                        .collect();
                    replies.push(Reply::text(format!(
                        "Some outputs could not be fetched: {}",
                        nodes.join(", ")
                    )));
                }
            }
            Err(e) => {
                error!(%identity, run_id, error = %e, "output download failed");
                replies.push(Reply::text("Failed to download run outputs."));
            }
        }

        replies
    }
}

/// Split `/command@bot args` into (`command`, `args`)
pub fn parse_command(text: &str) -> Option<(&str, &str)> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let command = head.split('@').next().unwrap_or(head);
    if command.is_empty() {
        return None;
    }
    Some((command, args.trim()))
}

pub fn format_status(snapshot: &RunStatusSnapshot) -> String {
    format!(
        "Run ID: {}\nStatus: {}\nWorkflow Name: {}\nStarted Date: {}\nIP Addresses: {}",
        snapshot.run_id,
        snapshot.status,
        snapshot.workflow_name,
        snapshot.started_date,
        snapshot.ip_addresses.join(", ")
    )
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
