//! Status poller sweeps against the fake client

use super::common::*;
use recon_bot::poller::{StatusPoller, SweepReport};
use recon_bot_sdk::{Identity, RunStatus};
use std::sync::Arc;
use std::time::Duration;

fn poller(
    store: &recon_bot::database::RunStore,
    client: &Arc<FakeClient>,
    notifier: &Arc<RecordingNotifier>,
) -> StatusPoller {
    StatusPoller::new(
        store.clone(),
        client.clone(),
        notifier.clone(),
        Duration::from_secs(3600),
    )
}

fn status_of(store: &recon_bot::database::RunStore, identity: i64, run_id: &str) -> RunStatus {
    store
        .get_run(Identity(identity), run_id)
        .unwrap()
        .unwrap()
        .status
}

// ============================================================================
// Transitions
// ============================================================================

#[tokio::test]
async fn test_completed_run_is_marked_and_notified() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    store
        .record_run(Identity(42), "abc123", "weekly", day(1), &sample_scope())
        .unwrap();
    client.set_status("abc123", "COMPLETED");

    let report = poller(&store, &client, &notifier).sweep().await;

    assert_eq!(
        report,
        SweepReport {
            checked: 1,
            completed: 1,
            ..Default::default()
        }
    );
    assert_eq!(status_of(&store, 42, "abc123"), RunStatus::Completed);
    assert_eq!(
        notifier.messages(),
        vec![(Identity(42), "Workflow abc123 has completed.".to_string())]
    );
}

#[tokio::test]
async fn test_status_is_matched_case_insensitively() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    store
        .record_run(Identity(1), "r1", "n", day(1), &sample_scope())
        .unwrap();
    client.set_status("r1", "Completed");

    let report = poller(&store, &client, &notifier).sweep().await;
    assert_eq!(report.completed, 1);
    assert_eq!(status_of(&store, 1, "r1"), RunStatus::Completed);
}

#[tokio::test]
async fn test_unknown_status_marks_run_failed() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    store
        .record_run(Identity(42), "gone", "n", day(1), &sample_scope())
        .unwrap();
    client.set_status("gone", "unknown");

    let report = poller(&store, &client, &notifier).sweep().await;

    assert_eq!(report.failed, 1);
    assert_eq!(status_of(&store, 42, "gone"), RunStatus::Failed);
    assert_eq!(
        notifier.messages(),
        vec![(Identity(42), "Workflow gone has failed.".to_string())]
    );
}

#[tokio::test]
async fn test_in_progress_run_is_left_pending() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    store
        .record_run(Identity(42), "busy", "n", day(1), &sample_scope())
        .unwrap();
    client.set_status("busy", "RUNNING");

    let report = poller(&store, &client, &notifier).sweep().await;

    assert_eq!(report.unchanged, 1);
    assert_eq!(status_of(&store, 42, "busy"), RunStatus::Pending);
    assert!(notifier.messages().is_empty());
}

#[tokio::test]
async fn test_empty_store_sweeps_nothing() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let report = poller(&store, &client, &notifier).sweep().await;
    assert_eq!(report, SweepReport::default());
}

// ============================================================================
// Isolation and notification guarantees
// ============================================================================

#[tokio::test]
async fn test_failed_status_query_does_not_stop_the_sweep() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    store
        .record_run(Identity(1), "bad", "n", day(1), &sample_scope())
        .unwrap();
    store
        .record_run(Identity(1), "good", "n", day(2), &sample_scope())
        .unwrap();
    client.break_run("bad");
    client.set_status("good", "COMPLETED");

    let report = poller(&store, &client, &notifier).sweep().await;

    assert_eq!(report.checked, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(status_of(&store, 1, "bad"), RunStatus::Pending);
    assert_eq!(status_of(&store, 1, "good"), RunStatus::Completed);
}

#[tokio::test]
async fn test_terminal_runs_are_not_notified_twice() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let poller = poller(&store, &client, &notifier);

    store
        .record_run(Identity(42), "abc123", "n", day(1), &sample_scope())
        .unwrap();
    client.set_status("abc123", "COMPLETED");

    poller.sweep().await;
    let second = poller.sweep().await;

    assert_eq!(second.checked, 0);
    assert_eq!(notifier.messages().len(), 1);
    assert_eq!(client.queries_for("abc123"), 1);
}

#[tokio::test]
async fn test_shared_run_id_is_queried_once_and_each_owner_notified() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    store
        .record_run(Identity(1), "shared", "n", day(1), &sample_scope())
        .unwrap();
    store
        .record_run(Identity(2), "shared", "n", day(1), &sample_scope())
        .unwrap();
    client.set_status("shared", "COMPLETED");

    let report = poller(&store, &client, &notifier).sweep().await;

    assert_eq!(report.checked, 1);
    assert_eq!(client.queries_for("shared"), 1);
    assert_eq!(status_of(&store, 1, "shared"), RunStatus::Completed);
    assert_eq!(status_of(&store, 2, "shared"), RunStatus::Completed);

    let mut recipients: Vec<Identity> = notifier.messages().into_iter().map(|(i, _)| i).collect();
    recipients.sort();
    assert_eq!(recipients, vec![Identity(1), Identity(2)]);
}

#[tokio::test]
async fn test_notify_failure_keeps_terminal_status() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());
    notifier.make_unreachable(Identity(42));

    store
        .record_run(Identity(42), "abc123", "n", day(1), &sample_scope())
        .unwrap();
    client.set_status("abc123", "COMPLETED");

    let report = poller(&store, &client, &notifier).sweep().await;

    assert_eq!(report.completed, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(status_of(&store, 42, "abc123"), RunStatus::Completed);
    assert!(notifier.messages().is_empty());
}

// ============================================================================
// Background task
// ============================================================================

#[tokio::test]
async fn test_spawned_poller_sweeps_and_shuts_down() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    store
        .record_run(Identity(42), "abc123", "n", day(1), &sample_scope())
        .unwrap();
    client.set_status("abc123", "COMPLETED");

    let handle = poller(&store, &client, &notifier).spawn();

    // First sweep runs immediately, before the first interval elapses
    tokio::time::timeout(Duration::from_secs(10), async {
        while notifier.messages().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("poller never swept");

    assert!(!handle.is_finished());
    handle.shutdown().await.unwrap();
    assert_eq!(notifier.messages().len(), 1);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_notification() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::with_delay(Duration::from_millis(500)));

    store
        .record_run(Identity(42), "abc123", "n", day(1), &sample_scope())
        .unwrap();
    client.set_status("abc123", "COMPLETED");

    let handle = poller(&store, &client, &notifier).spawn();

    tokio::time::timeout(Duration::from_secs(10), async {
        while notifier.attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("poller never started notifying");

    // The status is already terminal; shutting down now must not drop the message
    handle.shutdown().await.unwrap();

    assert_eq!(status_of(&store, 42, "abc123"), RunStatus::Completed);
    assert_eq!(
        notifier.messages(),
        vec![(Identity(42), "Workflow abc123 has completed.".to_string())]
    );
}

#[tokio::test]
async fn test_cancelled_sweep_leaves_remaining_runs_pending() {
    let (_dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::with_delay(Duration::from_millis(300)));

    store
        .record_run(Identity(1), "first", "n", day(1), &sample_scope())
        .unwrap();
    store
        .record_run(Identity(1), "second", "n", day(2), &sample_scope())
        .unwrap();
    client.set_status("first", "COMPLETED");
    client.set_status("second", "COMPLETED");

    let handle = poller(&store, &client, &notifier).spawn();
    tokio::time::timeout(Duration::from_secs(10), async {
        while notifier.attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("poller never started notifying");
    handle.shutdown().await.unwrap();

    // The run in flight finished; the next one was left for a later sweep
    assert_eq!(status_of(&store, 1, "first"), RunStatus::Completed);
    assert_eq!(status_of(&store, 1, "second"), RunStatus::Pending);
    assert_eq!(notifier.messages().len(), 1);
}
