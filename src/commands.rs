//! CLI command implementations

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use serde_json::{Value, json};
use trellis_buildtool::{BuildEvent, BuildToolClient, InvocationRequest, InvocationStatus};
use trellis_core::{ActionKind, CancelToken, Settings, Severity, find_workspace_root};
use trellis_indexer::WorkspaceScanner;
use trellis_server::{ServerConfig, TrellisServer};

/// Settings overrides assembled from global flags.
pub fn overrides(build_tool: Option<&str>) -> Value {
    match build_tool {
        Some(executable) => json!({ "build_tool": { "executable": executable } }),
        None => Value::Null,
    }
}

fn load_settings(root: &Path, overrides: &Value) -> anyhow::Result<(PathBuf, Settings)> {
    let root = find_workspace_root(root);
    let mut settings = Settings::load(&root)?;
    settings.apply_overrides(overrides)?;
    Ok((root, settings))
}

pub async fn serve(
    root: PathBuf,
    host: Option<String>,
    port: Option<u16>,
    watch: bool,
    overrides: Value,
) -> anyhow::Result<()> {
    let (root, settings) = load_settings(&root, &overrides)?;
    let config = ServerConfig {
        host: host.unwrap_or(settings.server.host),
        port: port.unwrap_or(settings.server.port),
        watch,
        overrides,
    };
    tracing::info!("Starting Trellis server on {}:{}", config.host, config.port);

    let server = TrellisServer::new(config);
    // Ready to answer before the client's first `initialize`.
    let result = server.state().initialize(&root, &Value::Null).await?;
    tracing::info!("Indexed {} targets under {}", result.scan.label_count, result.root.display());

    server.start().await
}

pub async fn scan(root: PathBuf, overrides: Value) -> anyhow::Result<ExitCode> {
    let (root, settings) = load_settings(&root, &overrides)?;
    let scanner = WorkspaceScanner::new(&root, settings)?;
    let report = tokio::task::spawn_blocking(move || scanner.scan(&CancelToken::new()))
        .await
        .context("scan task panicked")??;

    for target in report.graph.all_targets() {
        println!("{}\t{}", target.label, target.kind);
    }
    for (path, diagnostic) in &report.diagnostics {
        let severity = match diagnostic.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Information => "info",
            Severity::Hint => "hint",
        };
        let relative = path.strip_prefix(&root).unwrap_or(path);
        println!(
            "{}:{}:{}: {}: {}",
            relative.display(),
            diagnostic.range.start.line + 1,
            diagnostic.range.start.character + 1,
            severity,
            diagnostic.message
        );
    }
    println!(
        "{} targets in {} files, {} diagnostics ({:?})",
        report.graph.target_count(),
        report.files_scanned,
        report.diagnostics.len(),
        report.elapsed
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn query(root: PathBuf, expression: &str, overrides: Value) -> anyhow::Result<ExitCode> {
    let (root, settings) = load_settings(&root, &overrides)?;
    let client = BuildToolClient::new(root, settings.build_tool);
    match client.query(expression).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&*result)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(trellis_core::BuildToolError::QueryFailed { stderr, exit_code, .. }) => {
            // The tool's own message, unmodified.
            eprint!("{stderr}");
            Ok(exit_status(exit_code))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn build(root: PathBuf, target: String, flags: Vec<String>, overrides: Value) -> anyhow::Result<ExitCode> {
    let request = InvocationRequest::new(ActionKind::Build, target).with_flags(flags);
    invoke(root, request, overrides).await
}

pub async fn test(root: PathBuf, target: String, flags: Vec<String>, overrides: Value) -> anyhow::Result<ExitCode> {
    let request = InvocationRequest::new(ActionKind::Test, target).with_flags(flags);
    invoke(root, request, overrides).await
}

pub async fn run(root: PathBuf, target: String, args: Vec<String>, overrides: Value) -> anyhow::Result<ExitCode> {
    let mut request = InvocationRequest::new(ActionKind::Run, target);
    request.run_args = args;
    invoke(root, request, overrides).await
}

/// Stream events as JSON lines; Ctrl-C cancels the invocation.
async fn invoke(root: PathBuf, request: InvocationRequest, overrides: Value) -> anyhow::Result<ExitCode> {
    let (root, settings) = load_settings(&root, &overrides)?;
    let client = BuildToolClient::new(root, settings.build_tool);

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; cancelling");
            on_interrupt.cancel();
        }
    });

    let report = client
        .invoke(&request, cancel, |event: BuildEvent| match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!("Failed to serialize event: {}", err),
        })
        .await;
    interrupt.abort();
    let report = report?;

    if !report.stderr_tail.is_empty() && !report.succeeded() {
        eprintln!("{}", report.stderr_tail);
    }
    tracing::info!("{} {} finished in {}ms: {:?}", request.verb(), request.target, report.elapsed_ms, report.status);

    Ok(match report.status {
        InvocationStatus::Succeeded => ExitCode::SUCCESS,
        InvocationStatus::Failed { exit_code } => exit_status(exit_code),
        // Conventional status for termination by SIGINT.
        InvocationStatus::Cancelled => ExitCode::from(130),
    })
}

fn exit_status(code: Option<i32>) -> ExitCode {
    match code.and_then(|c| u8::try_from(c).ok()) {
        Some(0) | None => ExitCode::FAILURE,
        Some(code) => ExitCode::from(code),
    }
}
