//! End-to-end: authorize, fill the form, trigger, complete, notify, browse

use super::common::*;
use recon_bot::dispatcher::{
    Dispatcher, Incoming, Reply, MSG_AUTH_OK, MSG_NOT_AUTHORIZED,
};
use recon_bot::poller::StatusPoller;
use recon_bot_sdk::{Identity, RunStatus, TriggerOutcome};
use std::sync::Arc;
use std::time::Duration;

async fn say(dispatcher: &Dispatcher, identity: Identity, text: &str) -> Vec<Reply> {
    dispatcher
        .route(Incoming::Text {
            identity,
            text: text.to_string(),
        })
        .await
}

#[tokio::test]
async fn test_full_recon_lifecycle() {
    let (dir, store) = temp_store();
    let client = Arc::new(FakeClient::new());
    let notifier = Arc::new(RecordingNotifier::new());
    client.set_trigger(TriggerOutcome::Created("abc123".to_string()));

    let dispatcher = Dispatcher::new(Arc::new(service(&dir, &store, client.clone())));
    let poller = StatusPoller::new(
        store.clone(),
        client.clone(),
        notifier.clone(),
        Duration::from_secs(300),
    );
    let user = Identity(42);

    // Nothing works before authorization
    assert_eq!(
        say(&dispatcher, user, "/analyze").await,
        vec![Reply::Text(MSG_NOT_AUTHORIZED.to_string())]
    );
    assert_eq!(
        say(&dispatcher, user, &format!("/start {}", SECRET)).await,
        vec![Reply::Text(MSG_AUTH_OK.to_string())]
    );

    // Form
    say(&dispatcher, user, "/analyze").await;
    say(&dispatcher, user, "acme").await;
    say(&dispatcher, user, "a.com, b.com").await;
    let mut last = Vec::new();
    for _ in 0..6 {
        last = say(&dispatcher, user, "n").await;
    }
    match last.as_slice() {
        [Reply::Html(html)] => assert!(html.contains("a.com,b.com")),
        other => panic!("expected confirmation, got {:?}", other),
    }
    assert_eq!(
        say(&dispatcher, user, "yes").await,
        vec![Reply::Text("Workflow triggered. Run ID: abc123".to_string())]
    );

    let triggered = client.triggered.lock().unwrap().clone();
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].domains, "a.com,b.com");
    assert_eq!(triggered[0].subdomains, "");

    let runs = store.list_runs(user).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, "abc123");
    assert_eq!(runs[0].name, "acme");
    assert_eq!(runs[0].status, RunStatus::Pending);

    // Still running: no notification
    poller.sweep().await;
    assert!(notifier.messages().is_empty());

    // Completed: exactly one notification, never repeated
    client.set_status("abc123", "COMPLETED");
    poller.sweep().await;
    poller.sweep().await;
    assert_eq!(
        notifier.messages(),
        vec![(user, "Workflow abc123 has completed.".to_string())]
    );
    assert_eq!(
        store.get_run(user, "abc123").unwrap().unwrap().status,
        RunStatus::Completed
    );

    // History and run details with outputs
    match say(&dispatcher, user, "/history").await.as_slice() {
        [Reply::Keyboard { buttons, .. }] => {
            assert_eq!(buttons.len(), 1);
            assert!(buttons[0].0.starts_with("acme - "));
            assert_eq!(buttons[0].1, "abc123");
        }
        other => panic!("expected keyboard, got {:?}", other),
    }

    let replies = dispatcher
        .route(Incoming::Callback {
            identity: user,
            message_id: Some(5),
            data: "abc123".to_string(),
        })
        .await;

    match &replies[0] {
        Reply::Edit { message_id, text } => {
            assert_eq!(*message_id, 5);
            assert!(text.starts_with("Run ID: abc123\nStatus: COMPLETED"));
        }
        other => panic!("expected edit, got {:?}", other),
    }
    let documents: Vec<_> = replies[1..]
        .iter()
        .map(|reply| match reply {
            Reply::Document(path) => path.clone(),
            other => panic!("expected document, got {:?}", other),
        })
        .collect();
    assert_eq!(documents.len(), 2);
    for path in &documents {
        assert!(path.starts_with(dir.path().join("outputs").join("abc123")));
        assert!(path.is_file());
    }

    // Another authorized user cannot see the run
    say(&dispatcher, Identity(7), &format!("/start {}", SECRET)).await;
    let replies = dispatcher
        .route(Incoming::Callback {
            identity: Identity(7),
            message_id: None,
            data: "abc123".to_string(),
        })
        .await;
    assert_eq!(replies, vec![Reply::Text("Run not found.".to_string())]);
}
