//! trickest-cli client against a stand-in shell script

#![cfg(unix)]

use recon_bot::config::TrickestConfig;
use recon_bot::trickest::TrickestClient;
use recon_bot_sdk::{ClientError, ReportedState, Scope, ScopeField, TriggerOutcome, WorkflowClient};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Dispatches on the subcommand; argument positions follow the client's
/// invocation order (`<sub> --token T ...`).
const FAKE_CLI: &str = r#"#!/bin/sh
here="$(dirname "$0")"
case "$1" in
  execute)
    cat "$9" > "$here/execute-config.yaml"
    echo "Preparing run..."
    echo "Run successfully created! ID: run-1"
    ;;
  get)
    case "$5" in
      *run=slow) sleep 10 ;;
      *run=garbage) echo "error: not logged in" ;;
      *) echo '{"id":"run-1","status":"COMPLETED","workflow_name":"Recon","started_date":"2024-03-01","ip_addresses":["10.0.0.1"]}' ;;
    esac
    ;;
  output)
    if [ "$7" = "broken" ]; then
      echo "node not found" >&2
      exit 1
    fi
    echo "$7" > "$9/$7.txt"
    ;;
esac
"#;

fn install_fake_cli(dir: &Path) -> PathBuf {
    let path = dir.join("trickest-cli");
    std::fs::write(&path, FAKE_CLI).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(binary: PathBuf) -> TrickestConfig {
    TrickestConfig {
        binary,
        token: "tok".to_string(),
        workflow_id: "wf-1".to_string(),
        tool_timeout_secs: 3,
        output_nodes: vec!["cat-all-in-1".to_string(), "broken".to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_client_against_fake_cli() {
    let dir = tempfile::tempdir().unwrap();
    let client = TrickestClient::new(config(install_fake_cli(dir.path())));

    // Trigger renders the execute config and scrapes the run id
    let mut scope = Scope::default();
    scope.set(ScopeField::Domains, "a.com, b.com");
    assert_eq!(
        client.trigger(&scope).await.unwrap(),
        TriggerOutcome::Created("run-1".to_string())
    );
    let rendered = std::fs::read_to_string(dir.path().join("execute-config.yaml")).unwrap();
    let yaml: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
    assert_eq!(
        yaml["inputs"]["string-to-file-1.string"].as_str(),
        Some("a.com,b.com")
    );
    assert_eq!(yaml["inputs"]["string-to-file-2.string"].as_str(), Some(""));

    // Status
    let snapshot = client.fetch_status("run-1").await.unwrap();
    assert_eq!(snapshot.reported_state(), ReportedState::Completed);
    assert_eq!(snapshot.ip_addresses, vec!["10.0.0.1".to_string()]);

    let err = client.fetch_status("garbage").await.unwrap_err();
    assert!(matches!(err, ClientError::StatusParse { .. }));

    let err = client.fetch_status("slow").await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));

    // Outputs: one node fetched, one reported as failed
    let destination = dir.path().join("outputs").join("run-1");
    let report = client.fetch_outputs("run-1", &destination).await.unwrap();
    assert_eq!(report.fetched, vec!["cat-all-in-1".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].node, "broken");
    assert!(report.failed[0].reason.contains("node not found"));
    assert!(destination.join("cat-all-in-1.txt").is_file());
}

#[tokio::test]
async fn test_missing_binary_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let client = TrickestClient::new(config(dir.path().join("does-not-exist")));

    let err = client.fetch_status("run-1").await.unwrap_err();
    assert!(matches!(err, ClientError::Spawn { .. }));
}
