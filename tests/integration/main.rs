//! Integration tests for Trellis
//!
//! These exercise the binary and the crates working together on a real
//! workspace directory.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;
use trellis_core::{BuildGraph, CancelToken, Label, Position, Settings};
use trellis_indexer::WorkspaceScanner;
use trellis_lang::{DocumentRef, LanguageCoordinator};
use trellis_watcher::WorkspaceService;

fn trellis() -> Command {
    Command::new(env!("CARGO_BIN_EXE_trellis"))
}

fn write(root: &Path, path: &str, text: &str) {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, text).unwrap();
}

fn workspace() -> TempDir {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "MODULE.bazel", "");
    write(
        temp.path(),
        "app/BUILD",
        "go_binary(\n    name = \"server\",\n    srcs = [\"main.go\"],\n    deps = [\":lib\", \"//base:strings\"],\n)\n\ngo_library(name = \"lib\", srcs = [\"lib.go\"])\n",
    );
    write(temp.path(), "base/BUILD", "go_library(name = \"strings\", srcs = [\"strings.go\"])\n");
    temp
}

fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("tool");
    let script = format!(
        "#!/bin/sh\nfor arg in \"$@\"; do\n  case \"$arg\" in\n    --build_event_json_file=*) ev=\"${{arg#--build_event_json_file=}}\" ;;\n  esac\ndone\n{body}\n"
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Test that the CLI can be invoked
#[test]
fn test_cli_help() {
    let output = trellis().arg("--help").output().expect("Failed to execute trellis");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("trellis"));
    assert!(stdout.contains("serve"));
}

#[test]
fn test_cli_scan_isolates_broken_file() {
    let temp = workspace();
    write(temp.path(), "broken/BUILD", "go_library(\n    name = \"oops\",\n    srcs = [\"a.go\"\n");

    let output = trellis().args(["scan", "--root"]).arg(temp.path()).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("//app:server\tgo_binary"));
    assert!(stdout.contains("//base:strings\tgo_library"));
    assert!(stdout.contains("broken/BUILD:"));
    assert!(stdout.contains("3 targets in 3 files"));
}

#[test]
fn test_cli_build_streams_events_and_exits_with_status() {
    let temp = workspace();
    let tools = TempDir::new().unwrap();
    let ok = fake_tool(
        tools.path(),
        r##"
echo '{"id":{"started":{}},"started":{"command":"build"}}' >> "$ev"
echo '{"id":{"buildFinished":{}},"finished":{"overallSuccess":true,"exitCode":{"name":"SUCCESS"}}}' >> "$ev"
exit 0
"##,
    );

    let output = trellis()
        .args(["build", "//app:server", "--build-tool"])
        .arg(&ok)
        .arg("--root")
        .arg(temp.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let lines: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["type"], "started");
    assert_eq!(lines[1]["type"], "finished");

    fs::remove_file(&ok).unwrap();
    let failing = fake_tool(tools.path(), "echo 'ERROR: build failed' >&2\nexit 3");
    let output = trellis()
        .args(["build", "//app:server", "--build-tool"])
        .arg(&failing)
        .arg("--root")
        .arg(temp.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ERROR: build failed"));
}

#[test]
fn test_cli_query_failure_passes_message_through() {
    let temp = workspace();
    let tools = TempDir::new().unwrap();
    let tool = fake_tool(tools.path(), "echo \"ERROR: no such package 'nope'\" >&2\nexit 7");

    let output = trellis()
        .args(["query", "deps(//nope:all)", "--build-tool"])
        .arg(&tool)
        .arg("--root")
        .arg(temp.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(7));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ERROR: no such package 'nope'"));
}

/// An edit fed through the watcher is visible to definition lookups.
#[tokio::test]
async fn test_edit_flows_into_definition() {
    let temp = workspace();
    let root = temp.path();
    let settings = Settings::default();
    let graph = BuildGraph::new(root).into_shared();
    let service = Arc::new(WorkspaceService::new(
        WorkspaceScanner::new(root, settings.clone()).unwrap(),
        Arc::clone(&graph),
    ));
    tokio_test::assert_ok!(service.full_scan(CancelToken::new()).await);
    let coordinator = LanguageCoordinator::new(root, graph, &settings);

    let base_build = root.join("base/BUILD");
    let edited = "go_library(name = \"strings\", srcs = [\"strings.go\"])\n\ngo_library(name = \"bytes\")\n";
    service.did_change(&base_build, edited.to_string()).await;

    let doc = DocumentRef::new(root.join("app/notes.txt"), "see //base:bytes for details", 1);
    let location = coordinator.resolve_definition(&doc, Position::new(0, 8)).await.unwrap();
    assert_eq!(location.path, base_build);
    assert_eq!(location.range.start.line, 2);

    let graph = service.graph().read().await;
    let server = Label::parse("//app:server").unwrap();
    let deps: Vec<String> = graph.dependencies_of(&server).unwrap().iter().map(|d| d.to_string()).collect();
    assert_eq!(deps, vec!["//app:lib", "//base:strings"]);
    assert_eq!(graph.target_for_file(&root.join("app/main.go")).unwrap().label, server);
}
