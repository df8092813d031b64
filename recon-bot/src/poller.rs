//! Status poller
//!
//! Re-checks every Pending run on a fixed interval and moves it to Completed
//! or Failed when the platform says so, notifying the run's owners once per
//! transition. Each run is checked in isolation: a failed status query is
//! logged and the sweep moves on to the next run.

use anyhow::Result;
use recon_bot_sdk::{Identity, Notifier, ReportedState, Run, RunStatus, WorkflowClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::RunStore;

/// Counters for one pass over the Pending runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Distinct run ids queried
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub unchanged: usize,
    pub errors: usize,
}

pub struct StatusPoller {
    store: RunStore,
    client: Arc<dyn WorkflowClient>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(
        store: RunStore,
        client: Arc<dyn WorkflowClient>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            client,
            notifier,
            interval,
        }
    }

    /// One pass over every Pending run
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_until(&CancellationToken::new()).await
    }

    /// Like [`sweep`](Self::sweep), but stops before the next run once
    /// `shutdown` is cancelled. A run already being checked is finished,
    /// notifications included.
    async fn sweep_until(&self, shutdown: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();

        let runs = match self.store.pending_runs() {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "failed to load pending runs");
                report.errors += 1;
                return report;
            }
        };

        for (run_id, owners) in group_by_run_id(runs) {
            if shutdown.is_cancelled() {
                debug!("sweep interrupted by shutdown");
                break;
            }
            report.checked += 1;
            match self.check_run(&run_id, &owners).await {
                Ok(Some(RunStatus::Completed)) => report.completed += 1,
                Ok(Some(RunStatus::Failed)) => report.failed += 1,
                Ok(_) => report.unchanged += 1,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "status check failed");
                    report.errors += 1;
                }
            }
        }

        debug!(?report, "sweep finished");
        report
    }

    /// Query one run and apply a terminal transition if one was reported.
    ///
    /// Returns the new status, or `None` when the run stays Pending.
    async fn check_run(&self, run_id: &str, owners: &[Identity]) -> Result<Option<RunStatus>> {
        let snapshot = self.client.fetch_status(run_id).await?;

        let (status, message) = match snapshot.reported_state() {
            ReportedState::Completed => (
                RunStatus::Completed,
                format!("Workflow {} has completed.", run_id),
            ),
            ReportedState::Unknown => (
                RunStatus::Failed,
                format!("Workflow {} has failed.", run_id),
            ),
            ReportedState::Other(reported) => {
                debug!(run_id, status = %reported, "run still in progress");
                return Ok(None);
            }
        };

        // Zero rows means another writer already moved it
        if self.store.set_status(run_id, status)? == 0 {
            return Ok(None);
        }
        info!(run_id, %status, "run reached terminal state");

        for owner in owners {
            if let Err(e) = self.notifier.notify(*owner, &message).await {
                warn!(run_id, identity = %owner, error = %e, "failed to notify run owner");
            }
        }

        Ok(Some(status))
    }

    /// Sweep, sleep, repeat until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "status poller started");

        // Only the sleep is raced against shutdown; a sweep always finishes
        // the run it is checking
        loop {
            self.sweep_until(&shutdown).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("status poller stopped");
    }

    /// Run the poller on its own task
    pub fn spawn(self) -> PollerHandle {
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move { self.run(shutdown).await });

        PollerHandle {
            token,
            handle: Some(handle),
        }
    }
}

/// Owns the poller task. Dropping the handle cancels the task; call
/// [`PollerHandle::shutdown`] to also wait for it to finish.
pub struct PollerHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel the poller and wait for the run being checked to finish
    pub async fn shutdown(mut self) -> Result<(), JoinError> {
        self.token.cancel();
        match self.handle.take() {
            Some(handle) => handle.await,
            None => Ok(()),
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Pending rows grouped by run id, in first-seen order
fn group_by_run_id(runs: Vec<Run>) -> Vec<(String, Vec<Identity>)> {
    let mut groups: Vec<(String, Vec<Identity>)> = Vec::new();
    for run in runs {
        match groups.iter_mut().find(|(id, _)| *id == run.run_id) {
            Some((_, owners)) => owners.push(run.identity),
            None => groups.push((run.run_id, vec![run.identity])),
        }
    }
    groups
}
