//! Coordinator tests against fake engines written as shell scripts

#![cfg(unix)]

use crate::*;
use async_trait::async_trait;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use trellis_core::{CancelToken, LanguageEngineError, LanguageSettings, Position, Settings, SharedGraph};
use trellis_indexer::WorkspaceScanner;

/// Reads framed requests from stdin and answers each with `on_request`, a
/// `case "$msg" in ... esac` body that may call `respond`.
const ENGINE_PRELUDE: &str = r#"
respond() { printf 'Content-Length: %s\r\n\r\n%s' "${#1}" "$1"; }
while :; do
  len=""
  while IFS= read -r line; do
    line=$(printf '%s' "$line" | tr -d '\r')
    [ -z "$line" ] && break
    case "$line" in Content-Length:*) len=${line#Content-Length: } ;; esac
  done
  [ -z "$len" ] && exit 0
  msg=$(head -c "$len")
  id=$(printf '%s' "$msg" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  case "$msg" in
    *'"method":"initialize"'*) respond "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"capabilities\":{}}}" ;;
    *'"method":"shutdown"'*) respond "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":null}" ;;
"#;

/// Writes an executable engine script that appends to `<name>.starts` when
/// launched and handles `textDocument/definition` with `definition`.
fn fake_engine(dir: &Path, name: &str, definition: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\necho started >> \"{dir}/{name}.starts\"\n{ENGINE_PRELUDE}    *'\"method\":\"textDocument/definition\"'*) {definition} ;;\n  esac\ndone\n",
        dir = dir.display(),
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn starts(dir: &Path, name: &str) -> usize {
    fs::read_to_string(dir.join(format!("{name}.starts"))).map(|s| s.lines().count()).unwrap_or(0)
}

fn location_reply(path: &Path, line: u32) -> String {
    format!(
        r#"respond "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{\"uri\":\"file://{}\",\"range\":{{\"start\":{{\"line\":{line},\"character\":0}},\"end\":{{\"line\":{line},\"character\":4}}}}}}}}""#,
        path.display()
    )
}

fn write(root: &Path, path: &str, text: &str) -> PathBuf {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(&full, text).unwrap();
    full
}

fn workspace() -> (TempDir, SharedGraph) {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "MODULE.bazel", "");
    write(temp.path(), "go.mod", "module example.com/mono\n");
    write(
        temp.path(),
        "app/BUILD",
        "go_binary(\n    name = \"server\",\n    srcs = [\"main.go\"],\n    deps = [\":lib\", \"//base/strings\"],\n)\n\ngo_library(\n    name = \"lib\",\n    srcs = [\"lib.go\"],\n)\n",
    );
    write(temp.path(), "app/main.go", "package main\n");
    write(temp.path(), "app/lib.go", "package main\n");
    write(
        temp.path(),
        "base/strings/BUILD",
        "go_library(\n    name = \"strings\",\n    srcs = [\"strings.go\"],\n)\n",
    );
    write(temp.path(), "base/strings/strings.go", "package strings\n");
    let graph = WorkspaceScanner::new(temp.path(), Settings::default())
        .unwrap()
        .scan(&CancelToken::new())
        .unwrap()
        .graph
        .into_shared();
    (temp, graph)
}

fn engine_settings(program: &Path) -> LanguageSettings {
    LanguageSettings {
        engine_path: Some(program.display().to_string()),
        request_timeout_secs: 5,
        ..Default::default()
    }
}

fn coordinator_with(root: &Path, graph: SharedGraph, languages: &[(&str, LanguageSettings)]) -> LanguageCoordinator {
    let mut settings = Settings::default();
    for (id, language) in languages {
        settings.languages.insert(id.to_string(), language.clone());
    }
    LanguageCoordinator::new(root, graph, &settings)
}

fn doc(root: &Path, path: &str) -> DocumentRef {
    let path = root.join(path);
    let text = fs::read_to_string(&path).unwrap();
    DocumentRef::new(path, text, 1)
}

#[tokio::test]
async fn test_label_resolves_through_graph_without_engine() {
    let (temp, graph) = workspace();
    let engine = fake_engine(temp.path(), "gopls", "exit 1");
    let coordinator = coordinator_with(temp.path(), graph, &[("go", engine_settings(&engine))]);

    let build = doc(temp.path(), "app/BUILD");
    let location = coordinator.resolve_definition(&build, Position::new(3, 14)).await.unwrap();
    assert_eq!(location.path, temp.path().join("app/BUILD"));
    assert_eq!(location.range.start.line, 6);

    let location = coordinator.resolve_definition(&build, Position::new(3, 26)).await.unwrap();
    assert_eq!(location.path, temp.path().join("base/strings/BUILD"));

    let location = coordinator.resolve_definition(&build, Position::new(2, 15)).await.unwrap();
    assert_eq!(location.path, temp.path().join("app/main.go"));

    assert_eq!(starts(temp.path(), "gopls"), 0);
}

#[tokio::test]
async fn test_definition_delegates_to_engine() {
    let (temp, graph) = workspace();
    let target = temp.path().join("app/lib.go");
    let engine = fake_engine(temp.path(), "gopls", &location_reply(&target, 0));
    let coordinator = coordinator_with(temp.path(), graph, &[("go", engine_settings(&engine))]);

    let main = DocumentRef::new(temp.path().join("app/main.go"), "package main\n\nfunc main() { helper() }\n", 1);
    let location = coordinator.resolve_definition(&main, Position::new(2, 16)).await.unwrap();
    assert_eq!(location.path, target);

    // The engine stays up for the session.
    tokio_test::assert_ok!(coordinator.adapter("go").unwrap().start().await);
    coordinator.resolve_definition(&main, Position::new(2, 16)).await.unwrap();
    assert_eq!(starts(temp.path(), "gopls"), 1);
    assert_eq!(coordinator.statuses().await.get("go"), Some(&EngineStatus::Running));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_crashed_engine_restarts_after_backoff() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("lib.go");
    let crash_marker = temp.path().join("crash");
    fs::write(&crash_marker, "").unwrap();
    let reply = format!("if [ -f \"{}\" ]; then exit 1; fi; {}", crash_marker.display(), location_reply(&target, 2));
    let engine = fake_engine(temp.path(), "gopls", &reply);

    let settings = engine_settings(&engine);
    let command = EngineCommand::resolve(&settings, "gopls", &[]);
    let supervisor = EngineSupervisor::new("go", command, temp.path(), &settings);
    let document = DocumentRef::new(temp.path().join("main.go"), "package main\n", 1);

    let first = supervisor.definition(&document, Position::new(0, 0)).await;
    assert!(matches!(first, Err(LanguageEngineError::Crashed(_))), "{first:?}");
    let second = supervisor.definition(&document, Position::new(0, 0)).await;
    assert!(matches!(second, Err(LanguageEngineError::BackingOff { .. })), "{second:?}");
    assert_eq!(starts(temp.path(), "gopls"), 1);

    fs::remove_file(&crash_marker).unwrap();
    tokio::time::sleep(backoff_delay(1) + Duration::from_millis(100)).await;
    let third = supervisor.definition(&document, Position::new(0, 0)).await.unwrap().unwrap();
    assert_eq!(third.path, target);
    assert_eq!(third.range.start.line, 2);
    assert_eq!(starts(temp.path(), "gopls"), 2);
    assert_eq!(supervisor.status().await, EngineStatus::Running);
    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_answers_during_handshake() {
    let temp = TempDir::new().unwrap();
    let engine = temp.path().join("slow-engine");
    fs::write(&engine, format!("#!/bin/sh\nsleep 1\n{ENGINE_PRELUDE}  esac\ndone\n")).unwrap();
    fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();
    let command = EngineCommand { program: engine.display().to_string(), args: vec![] };
    let supervisor = Arc::new(EngineSupervisor::new("go", command, temp.path(), &LanguageSettings::default()));

    let start = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.start().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = tokio::time::timeout(Duration::from_millis(100), supervisor.status()).await.unwrap();
    assert_eq!(status, EngineStatus::Starting);

    tokio_test::assert_ok!(start.await.unwrap());
    assert_eq!(supervisor.status().await, EngineStatus::Running);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_engine_failure_is_isolated() {
    let (temp, graph) = workspace();
    let broken = fake_engine(temp.path(), "gopls", "exit 1");
    let python_target = write(temp.path(), "tools/gen.py", "def gen():\n    pass\n");
    let healthy = fake_engine(temp.path(), "pylsp", &location_reply(&python_target, 0));
    let coordinator = coordinator_with(
        temp.path(),
        graph.clone(),
        &[("go", engine_settings(&broken)), ("python", engine_settings(&healthy))],
    );

    let go_doc = DocumentRef::new(temp.path().join("app/main.go"), "package main\n\nfunc main() { helper() }\n", 1);
    assert!(coordinator.resolve_definition(&go_doc, Position::new(2, 16)).await.is_none());
    assert!(matches!(coordinator.statuses().await.get("go"), Some(EngineStatus::BackingOff { .. })));

    let py_doc = DocumentRef::new(temp.path().join("tools/run.py"), "from tools.gen import gen\ngen()\n", 1);
    let location = coordinator.resolve_definition(&py_doc, Position::new(1, 1)).await.unwrap();
    assert_eq!(location.path, python_target);

    let main = temp.path().join("app/main.go");
    assert_eq!(graph.read().await.target_for_file(&main).unwrap().label.to_string(), "//app:server");
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_import_fallback_resolves_via_graph() {
    let (temp, graph) = workspace();
    let disabled = LanguageSettings { enabled: false, ..Default::default() };
    let coordinator = coordinator_with(temp.path(), graph, &[("go", disabled)]);

    let main = DocumentRef::new(
        temp.path().join("app/main.go"),
        "package main\n\nimport (\n\t\"example.com/mono/base/strings\"\n)\n",
        1,
    );
    let location = coordinator.resolve_definition(&main, Position::new(3, 12)).await.unwrap();
    assert_eq!(location.path, temp.path().join("base/strings/BUILD"));
    assert!(coordinator.resolve_definition(&main, Position::new(0, 3)).await.is_none());
}

struct NoCapabilities;

#[async_trait]
impl LanguageAdapter for NoCapabilities {
    fn language_id(&self) -> &str {
        "typescript"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    async fn definition(
        &self,
        _doc: &DocumentRef,
        _position: Position,
    ) -> Result<Option<trellis_core::Location>, LanguageEngineError> {
        panic!("definition called on an adapter without the capability")
    }
}

#[tokio::test]
async fn test_missing_capability_degrades_to_empty() {
    let (temp, graph) = workspace();
    let coordinator = LanguageCoordinator::new(temp.path(), graph, &Settings::default()).with_adapter(Arc::new(NoCapabilities));

    let ts = DocumentRef::new(temp.path().join("web/app.ts"), "import x from './x';\nx.run();\n", 1);
    assert!(coordinator.resolve_definition(&ts, Position::new(1, 2)).await.is_none());
    assert!(coordinator.completion(&ts, Position::new(1, 2)).await.is_empty());
    assert_eq!(coordinator.statuses().await.get("typescript"), Some(&EngineStatus::Disabled));
}

#[tokio::test]
async fn test_build_file_completion() {
    let (temp, graph) = workspace();
    let coordinator = LanguageCoordinator::new(temp.path(), graph, &Settings::default());
    let path = temp.path().join("app/BUILD");

    let labels = coordinator
        .completion(&DocumentRef::new(&path, "    deps = [\":l", 1), Position::new(0, 15))
        .await;
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].label, ":lib");
    assert_eq!(labels[0].detail.as_deref(), Some("go_library"));

    let absolute = coordinator
        .completion(&DocumentRef::new(&path, "    deps = [\"//base", 1), Position::new(0, 19))
        .await;
    assert_eq!(absolute.iter().map(|c| c.label.as_str()).collect::<Vec<_>>(), vec!["//base/strings:strings"]);

    let rules = coordinator.completion(&DocumentRef::new(&path, "go_t", 1), Position::new(0, 4)).await;
    assert_eq!(rules, vec![CompletionItem::new("go_test", CompletionKind::Rule)]);
}

#[tokio::test]
async fn test_hover_describes_target() {
    let (temp, graph) = workspace();
    let coordinator = LanguageCoordinator::new(temp.path(), graph, &Settings::default());
    let build = doc(temp.path(), "app/BUILD");

    let hover = coordinator.hover(&build, Position::new(3, 14)).await.unwrap();
    assert!(hover.contents.starts_with("**go_library** `//app:lib`"));
    assert!(hover.contents.contains("`lib.go`"));

    let on_call = coordinator.hover(&build, Position::new(1, 5)).await.unwrap();
    assert!(on_call.contents.contains("Deps: `//app:lib`, `//base/strings:strings`"));
}
