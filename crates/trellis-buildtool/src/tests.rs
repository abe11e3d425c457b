//! Client tests against a fake build tool written as a shell script

#![cfg(unix)]

use crate::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use trellis_core::{ActionKind, BuildToolError, BuildToolSettings, CancelToken};

const EVENT_FILE_ARG: &str = r#"
for arg in "$@"; do
  case "$arg" in
    --build_event_json_file=*) ev="${arg#--build_event_json_file=}" ;;
  esac
done
"#;

/// Writes an executable `tool` script into `dir` that logs each call to
/// `calls.log` before running `body`.
fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("tool");
    let script = format!("#!/bin/sh\necho \"$*\" >> \"{}/calls.log\"\n{}\n{}\n", dir.display(), EVENT_FILE_ARG, body);
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(dir: &Path) -> usize {
    fs::read_to_string(dir.join("calls.log")).map(|s| s.lines().count()).unwrap_or(0)
}

fn client(dir: &Path, tool: &Path) -> BuildToolClient {
    let settings = BuildToolSettings {
        executable: tool.display().to_string(),
        cancel_grace_ms: 200,
        ..Default::default()
    };
    BuildToolClient::new(dir, settings)
}

const QUERY_BODY: &str = r##"
if [ -f "$(dirname "$0")/fail" ]; then
  echo "ERROR: no such package 'app'" >&2
  exit 7
fi
sleep 0.2
echo '{"type":"RULE","rule":{"name":"//app:server","ruleClass":"go_binary","attribute":[{"name":"visibility","stringListValue":["//visibility:public"]}],"ruleInput":["//app:main.go"]}}'
"##;

#[tokio::test]
async fn test_two_queries_spawn_one_subprocess() {
    let temp = TempDir::new().unwrap();
    let tool = fake_tool(temp.path(), QUERY_BODY);
    let client = client(temp.path(), &tool);

    let (a, b) = tokio::join!(client.query("deps(//app:server)"), client.query("deps( //app:server )"));
    assert_eq!(a.unwrap().targets.len(), 1);
    assert_eq!(b.unwrap().targets.len(), 1);
    client.query("deps(//app:server)").await.unwrap();

    assert_eq!(calls(temp.path()), 1);
}

#[tokio::test]
async fn test_change_in_affected_package_forces_refetch() {
    let temp = TempDir::new().unwrap();
    let tool = fake_tool(temp.path(), QUERY_BODY);
    let client = client(temp.path(), &tool);

    client.query("deps(//app:server)").await.unwrap();
    assert_eq!(client.invalidate_path(&temp.path().join("other/lib.go")), 0);
    client.query("deps(//app:server)").await.unwrap();
    assert_eq!(calls(temp.path()), 1);

    assert_eq!(client.invalidate_path(&temp.path().join("app/main.go")), 1);
    client.query("deps(//app:server)").await.unwrap();
    assert_eq!(calls(temp.path()), 2);
}

#[tokio::test]
async fn test_change_during_query_is_not_lost() {
    let temp = TempDir::new().unwrap();
    let tool = fake_tool(temp.path(), QUERY_BODY);
    let client = client(temp.path(), &tool);

    let (first, dropped) = tokio::join!(client.query("deps(//app:server)"), async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        client.invalidate_path(&temp.path().join("app/BUILD"))
    });
    first.unwrap();
    assert_eq!(dropped, 0);

    // The result computed before the change must not be served.
    client.query("deps(//app:server)").await.unwrap();
    assert_eq!(calls(temp.path()), 2);
    client.query("deps(//app:server)").await.unwrap();
    assert_eq!(calls(temp.path()), 2);
}

#[tokio::test]
async fn test_failure_is_passed_through_and_not_cached() {
    let temp = TempDir::new().unwrap();
    let tool = fake_tool(temp.path(), QUERY_BODY);
    let client = client(temp.path(), &tool);

    fs::write(temp.path().join("fail"), "").unwrap();
    match client.query("//app:server").await {
        Err(BuildToolError::QueryFailed { exit_code, stderr, .. }) => {
            assert_eq!(exit_code, Some(7));
            assert_eq!(stderr.trim(), "ERROR: no such package 'app'");
        }
        other => panic!("expected QueryFailed, got {other:?}"),
    }

    fs::remove_file(temp.path().join("fail")).unwrap();
    let info = client.target_info("//app:server").await.unwrap();
    assert_eq!(info.kind, "go_binary");
    assert_eq!(info.visibility, vec!["//visibility:public"]);
    assert_eq!(calls(temp.path()), 2);
}

#[tokio::test]
async fn test_build_delivers_events_in_order() {
    let temp = TempDir::new().unwrap();
    let tool = fake_tool(
        temp.path(),
        r##"
echo '{"id":{"started":{}},"started":{"command":"build"}}' >> "$ev"
echo '{"id":{"actionCompleted":{"label":"//app:server"}},"action":{"success":true}}' >> "$ev"
echo '{"id":{"buildFinished":{}},"finished":{"overallSuccess":true,"exitCode":{"name":"SUCCESS"}}}' >> "$ev"
exit 0
"##,
    );
    let client = client(temp.path(), &tool);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let request = InvocationRequest::new(ActionKind::Build, "//app:server");
    let report = client
        .invoke(&request, CancelToken::new(), move |event| sink.lock().unwrap().push(event))
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::Succeeded);
    assert_eq!(report.finished, Some(true));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(matches!(seen[0], BuildEvent::Started { .. }));
    assert!(matches!(seen[1], BuildEvent::ActionCompleted { success: true, .. }));
    assert!(matches!(seen[2], BuildEvent::Finished { success: true, .. }));
}

#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let temp = TempDir::new().unwrap();
    let tool = fake_tool(
        temp.path(),
        r##"
echo '{"id":{"started":{}},"started":{}}' >> "$ev"
echo 'garbage' >> "$ev"
echo '{"id":{"testResult":{"label":"//app:t"}},"testResult":{"status":"FAILED","testAttemptDurationMillis":"12"}}' >> "$ev"
printf '%s' '{"id":{"buildFinished":{}},"finished":{"exitCode":{"name":"TESTS_FAILED","code":3}}}' >> "$ev"
echo "1 test failed" >&2
exit 3
"##,
    );
    let client = client(temp.path(), &tool);

    let request = InvocationRequest::new(ActionKind::Test, "//app:t");
    let report = tokio_test::assert_ok!(client.invoke(&request, CancelToken::new(), |_| {}).await);

    assert_eq!(report.status, InvocationStatus::Failed { exit_code: Some(3) });
    assert_eq!(report.malformed_records, 1);
    assert_eq!(report.events_delivered, 3);
    assert_eq!(report.finished, Some(false));
    assert_eq!(report.test_results.len(), 1);
    assert!(!report.test_results[0].passed);
    assert_eq!(report.stderr_tail, "1 test failed");
}

#[tokio::test]
async fn test_cancelled_test_resolves_as_cancelled() {
    let temp = TempDir::new().unwrap();
    let tool = fake_tool(
        temp.path(),
        r##"
echo '{"id":{"started":{}},"started":{"command":"test"}}' >> "$ev"
exec sleep 30
"##,
    );
    let client = Arc::new(client(temp.path(), &tool));
    let cancel = CancelToken::new();
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();

    let task = {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let request = InvocationRequest::new(ActionKind::Test, "//app:t");
            client
                .invoke(&request, cancel, move |event| {
                    let _ = started_tx.send(event);
                })
                .await
        })
    };

    let first = tokio::time::timeout(Duration::from_secs(5), started_rx.recv()).await.unwrap();
    assert!(matches!(first, Some(BuildEvent::Started { .. })));
    cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    assert_eq!(report.status, InvocationStatus::Cancelled);
    assert_eq!(report.events_delivered, 1);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let temp = TempDir::new().unwrap();
    let tool = fake_tool(temp.path(), "exit 0");
    let client = client(temp.path(), &tool);
    let cancel = CancelToken::new();
    cancel.cancel();

    let request = InvocationRequest::new(ActionKind::Build, "//a");
    let result = client.invoke(&request, cancel, |_| {}).await;
    assert_eq!(result, Err(BuildToolError::Cancelled));
    assert_eq!(calls(temp.path()), 0);
}

#[tokio::test]
async fn test_missing_executable() {
    let temp = TempDir::new().unwrap();
    let client = client(temp.path(), &temp.path().join("no-such-tool"));
    let result = client.query("//...").await;
    assert!(matches!(result, Err(BuildToolError::ExecutableNotFound(_))));
}
