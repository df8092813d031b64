//! Capabilities exposed to the chat front end
//!
//! Authorization, triggering, status, history and output download, all keyed
//! by the caller's chat identity. Everything except `authorize` requires the
//! identity to be on the allow-list.

use chrono::Local;
use recon_bot_sdk::{
    ClientError, Identity, OutputReport, ReportedState, Run, RunStatusSnapshot, Scope,
    TriggerOutcome, WorkflowClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::database::{RunStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("authorization failed")]
    Unauthorized,

    #[error("the workflow tool did not report a run id")]
    TriggerFailed,

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("run {run_id} is not completed (status: {status})")]
    NotCompleted { run_id: String, status: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("run id {0:?} cannot be used as a directory name")]
    InvalidRunId(String),

    #[error("failed to list downloaded outputs: {0}")]
    Io(#[from] std::io::Error),
}

/// Files fetched for a completed run
#[derive(Debug, Clone)]
pub struct DownloadedOutputs {
    pub report: OutputReport,
    /// Regular files in the destination directory, sorted by path
    pub files: Vec<PathBuf>,
}

pub struct ReconService {
    store: RunStore,
    client: Arc<dyn WorkflowClient>,
    auth_secret: String,
    outputs_dir: PathBuf,
}

impl ReconService {
    pub fn new(
        store: RunStore,
        client: Arc<dyn WorkflowClient>,
        auth_secret: impl Into<String>,
        outputs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            client,
            auth_secret: auth_secret.into(),
            outputs_dir: outputs_dir.into(),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Add `identity` to the allow-list if `presented` matches the shared secret
    pub fn authorize(&self, identity: Identity, presented: &str) -> Result<(), ServiceError> {
        if !secrets_match(presented, &self.auth_secret) {
            warn!(%identity, "authorization rejected");
            return Err(ServiceError::Unauthorized);
        }
        self.store.authorize(identity)?;
        info!(%identity, "identity authorized");
        Ok(())
    }

    pub fn is_authorized(&self, identity: Identity) -> Result<bool, ServiceError> {
        Ok(self.store.is_authorized(identity)?)
    }

    fn require_authorized(&self, identity: Identity) -> Result<(), ServiceError> {
        if self.store.is_authorized(identity)? {
            Ok(())
        } else {
            Err(ServiceError::Unauthorized)
        }
    }

    /// Launch a run and record it as Pending. Returns the new run id.
    ///
    /// Nothing is recorded when the tool reports no run id.
    pub async fn trigger(
        &self,
        identity: Identity,
        name: &str,
        scope: &Scope,
    ) -> Result<String, ServiceError> {
        self.require_authorized(identity)?;

        let run_id = match self.client.trigger(scope).await? {
            TriggerOutcome::Created(run_id) => run_id,
            TriggerOutcome::NotFound => return Err(ServiceError::TriggerFailed),
        };

        self.store
            .record_run(identity, &run_id, name, Local::now().date_naive(), scope)?;
        info!(%identity, run_id = %run_id, name, "run recorded");
        Ok(run_id)
    }

    /// Live status of the identity's most recent run, if it has any
    pub async fn status(
        &self,
        identity: Identity,
    ) -> Result<Option<RunStatusSnapshot>, ServiceError> {
        self.require_authorized(identity)?;

        match self.store.most_recent_run(identity)? {
            Some(run_id) => Ok(Some(self.client.fetch_status(&run_id).await?)),
            None => Ok(None),
        }
    }

    pub fn history(&self, identity: Identity) -> Result<Vec<Run>, ServiceError> {
        self.require_authorized(identity)?;
        Ok(self.store.list_runs(identity)?)
    }

    /// Live status of one of the identity's runs
    pub async fn run_details(
        &self,
        identity: Identity,
        run_id: &str,
    ) -> Result<RunStatusSnapshot, ServiceError> {
        self.require_authorized(identity)?;

        if self.store.get_run(identity, run_id)?.is_none() {
            return Err(ServiceError::RunNotFound(run_id.to_string()));
        }
        Ok(self.client.fetch_status(run_id).await?)
    }

    /// Fetch the outputs of a completed run into `<outputs_dir>/<run_id>`.
    ///
    /// `snapshot` is the status the caller already fetched for this run; no
    /// second status query is made.
    pub async fn download_outputs(
        &self,
        identity: Identity,
        run_id: &str,
        snapshot: &RunStatusSnapshot,
    ) -> Result<DownloadedOutputs, ServiceError> {
        self.require_authorized(identity)?;
        if self.store.get_run(identity, run_id)?.is_none() {
            return Err(ServiceError::RunNotFound(run_id.to_string()));
        }
        if snapshot.reported_state() != ReportedState::Completed {
            return Err(ServiceError::NotCompleted {
                run_id: run_id.to_string(),
                status: snapshot.status.clone(),
            });
        }

        let dir_name =
            output_dir_name(run_id).ok_or_else(|| ServiceError::InvalidRunId(run_id.to_string()))?;
        let destination = self.outputs_dir.join(dir_name);
        let report = self.client.fetch_outputs(run_id, &destination).await?;
        if !report.is_complete() {
            warn!(
                run_id,
                failed = report.failed.len(),
                fetched = report.fetched.len(),
                "some output nodes could not be fetched"
            );
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&destination).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        Ok(DownloadedOutputs { report, files })
    }
}

/// Compare without short-circuiting on the first differing byte
fn secrets_match(presented: &str, expected: &str) -> bool {
    if presented.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// The run id itself, if it is usable as a directory name.
///
/// Only `[A-Za-z0-9_-]` is accepted; rewriting other characters would let two
/// distinct ids share one output directory.
fn output_dir_name(run_id: &str) -> Option<&str> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(run_id)
}
