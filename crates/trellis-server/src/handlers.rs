//! REST handlers for the editor-facing API

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use trellis_buildtool::{InvocationRequest, QueryResult};
use trellis_core::{
    ActionKind, CacheStats, Diagnostic, GraphChange, Label, Location, Position, Range, TargetAction, TargetSummary,
};
use trellis_lang::text::label_token_at;
use trellis_lang::{CompletionItem, DocumentRef, EngineStatus, Hover};

use crate::error::{ServerError, ServerResult};
use crate::state::{InitializeResult, ServerState, Workspace};

type AppState = State<Arc<ServerState>>;

// ── Request / response shapes ───────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InitializeParams {
    pub root: PathBuf,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Deserialize)]
pub struct PathParams {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct LabelParams {
    pub label: String,
    #[serde(default)]
    pub transitive: bool,
}

#[derive(Debug, Deserialize)]
pub struct DocumentParams {
    pub path: PathBuf,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PositionParams {
    pub path: PathBuf,
    pub position: Position,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub expression: String,
}

#[derive(Debug, Deserialize)]
pub struct CommandParams {
    pub target: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub run_args: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub initialized: bool,
}

#[derive(Debug, Serialize)]
pub struct TargetForFileResponse {
    pub path: PathBuf,
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LabelsResponse {
    pub label: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub path: PathBuf,
    pub version: i32,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Serialize)]
pub struct DefinitionResponse {
    pub location: Option<Location>,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub items: Vec<CompletionItem>,
}

#[derive(Debug, Serialize)]
pub struct HoverResponse {
    pub hover: Option<Hover>,
}

#[derive(Debug, Serialize)]
pub struct InvocationStarted {
    pub invocation_id: u64,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub invocation_id: u64,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub root: PathBuf,
    pub label_count: usize,
    pub file_count: usize,
    pub open_documents: usize,
    pub engines: BTreeMap<String, EngineStatus>,
    pub query_cache: CacheStats,
    pub running_invocations: Vec<u64>,
}

fn parse_label(raw: &str) -> ServerResult<Label> {
    Ok(Label::parse(raw)?)
}

// ── Lifecycle ───────────────────────────────────────────────

pub async fn health(State(state): AppState) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        initialized: state.current_root().await.is_some(),
    })
}

pub async fn initialize(State(state): AppState, Json(params): Json<InitializeParams>) -> ServerResult<Json<InitializeResult>> {
    Ok(Json(state.initialize(&params.root, &params.options).await?))
}

/// Rescan the whole workspace.
pub async fn refresh(State(state): AppState) -> ServerResult<Json<trellis_watcher::ScanSummary>> {
    let workspace = state.workspace().await?;
    Ok(Json(workspace.service.full_scan(trellis_core::CancelToken::new()).await?))
}

pub async fn status(State(state): AppState) -> ServerResult<Json<StatusResponse>> {
    let workspace = state.workspace().await?;
    let (label_count, file_count) = {
        let graph = workspace.service.graph().read().await;
        (graph.target_count(), graph.file_count())
    };
    Ok(Json(StatusResponse {
        root: workspace.root.clone(),
        label_count,
        file_count,
        open_documents: workspace.service.documents().len(),
        engines: workspace.coordinator.statuses().await,
        query_cache: workspace.client.cache_stats(),
        running_invocations: state.running_invocations(),
    }))
}

// ── Targets ─────────────────────────────────────────────────

pub async fn list_targets(State(state): AppState) -> ServerResult<Json<Vec<TargetSummary>>> {
    let workspace = state.workspace().await?;
    let graph = workspace.service.graph().read().await;
    Ok(Json(graph.all_targets().into_iter().map(|t| t.summary()).collect()))
}

pub async fn target_for_file(
    State(state): AppState,
    Query(params): Query<PathParams>,
) -> ServerResult<Json<TargetForFileResponse>> {
    let workspace = state.workspace().await?;
    let path = workspace.resolve_path(&params.path);
    let graph = workspace.service.graph().read().await;
    let label = graph.target_for_file(&path).map(|t| t.label.to_string());
    Ok(Json(TargetForFileResponse { path, label }))
}

pub async fn dependencies(State(state): AppState, Query(params): Query<LabelParams>) -> ServerResult<Json<LabelsResponse>> {
    let label = parse_label(&params.label)?;
    let workspace = state.workspace().await?;
    let graph = workspace.service.graph().read().await;
    let deps = graph
        .dependencies_of(&label)
        .ok_or_else(|| ServerError::NotFound(format!("unknown target {label}")))?;
    Ok(Json(LabelsResponse { label: label.to_string(), labels: deps.iter().map(|d| d.to_string()).collect() }))
}

pub async fn reverse_dependencies(
    State(state): AppState,
    Query(params): Query<LabelParams>,
) -> ServerResult<Json<LabelsResponse>> {
    let label = parse_label(&params.label)?;
    let workspace = state.workspace().await?;
    let graph = workspace.service.graph().read().await;
    let dependents = if params.transitive {
        graph.transitive_reverse_dependencies(&label)
    } else {
        graph.reverse_dependencies(&label)
    };
    Ok(Json(LabelsResponse { label: label.to_string(), labels: dependents.iter().map(|d| d.to_string()).collect() }))
}

pub async fn target_location(State(state): AppState, Query(params): Query<LabelParams>) -> ServerResult<Json<Location>> {
    let label = parse_label(&params.label)?;
    let workspace = state.workspace().await?;
    let graph = workspace.service.graph().read().await;
    graph
        .target(&label)
        .map(|t| Json(t.location.clone()))
        .ok_or_else(|| ServerError::NotFound(format!("unknown target {label}")))
}

/// Where dependents mention `label`.
pub async fn references(State(state): AppState, Query(params): Query<LabelParams>) -> ServerResult<Json<Vec<Location>>> {
    let label = parse_label(&params.label)?;
    let workspace = state.workspace().await?;
    let graph = workspace.service.graph().read().await;
    Ok(Json(graph.find_references(&label)))
}

// ── Documents ───────────────────────────────────────────────

async fn document_response(workspace: &Workspace, path: PathBuf, version: i32) -> Json<DocumentResponse> {
    let diagnostics = workspace.service.graph().read().await.diagnostics_for(&path);
    Json(DocumentResponse { path, version, diagnostics })
}

fn required_text(params: DocumentParams) -> ServerResult<(PathBuf, String)> {
    match params.text {
        Some(text) => Ok((params.path, text)),
        None => Err(ServerError::BadRequest("`text` is required".to_string())),
    }
}

pub async fn did_open(State(state): AppState, Json(params): Json<DocumentParams>) -> ServerResult<Json<DocumentResponse>> {
    let workspace = state.workspace().await?;
    let (path, text) = required_text(params)?;
    let path = workspace.resolve_path(&path);
    let document = workspace.service.did_open(&path, text).await;
    Ok(document_response(&workspace, document.path, document.version).await)
}

pub async fn did_change(State(state): AppState, Json(params): Json<DocumentParams>) -> ServerResult<Json<DocumentResponse>> {
    let workspace = state.workspace().await?;
    let (path, text) = required_text(params)?;
    let path = workspace.resolve_path(&path);
    let document = workspace.service.did_change(&path, text).await;
    Ok(document_response(&workspace, document.path, document.version).await)
}

pub async fn did_save(State(state): AppState, Json(params): Json<DocumentParams>) -> ServerResult<Json<GraphChange>> {
    let workspace = state.workspace().await?;
    let path = workspace.resolve_path(&params.path);
    Ok(Json(workspace.service.did_save(&path, params.text).await))
}

pub async fn did_close(State(state): AppState, Json(params): Json<DocumentParams>) -> ServerResult<Json<GraphChange>> {
    let workspace = state.workspace().await?;
    let path = workspace.resolve_path(&params.path);
    Ok(Json(workspace.service.did_close(&path).await))
}

pub async fn diagnostics(State(state): AppState, Query(params): Query<PathParams>) -> ServerResult<Json<Vec<Diagnostic>>> {
    let workspace = state.workspace().await?;
    let path = workspace.resolve_path(&params.path);
    Ok(Json(workspace.service.graph().read().await.diagnostics_for(&path)))
}

/// Build/test/run actions offered on each declaration of a build file.
pub async fn actions(State(state): AppState, Query(params): Query<PathParams>) -> ServerResult<Json<Vec<TargetAction>>> {
    let workspace = state.workspace().await?;
    let path = workspace.resolve_path(&params.path);
    Ok(Json(workspace.service.graph().read().await.code_lenses(&path)))
}

// ── Language features ───────────────────────────────────────

async fn document_at(workspace: &Workspace, path: &std::path::Path) -> ServerResult<DocumentRef> {
    let path = workspace.resolve_path(path);
    let (text, version) = workspace.document_text(&path).await?;
    Ok(DocumentRef::new(path, text, version))
}

pub async fn definition(State(state): AppState, Json(params): Json<PositionParams>) -> ServerResult<Json<DefinitionResponse>> {
    let workspace = state.workspace().await?;
    let doc = document_at(&workspace, &params.path).await?;
    let location = workspace.coordinator.resolve_definition(&doc, params.position).await;
    Ok(Json(DefinitionResponse { location }))
}

pub async fn completion(State(state): AppState, Json(params): Json<PositionParams>) -> ServerResult<Json<CompletionResponse>> {
    let workspace = state.workspace().await?;
    let doc = document_at(&workspace, &params.path).await?;
    let items = workspace.coordinator.completion(&doc, params.position).await;
    Ok(Json(CompletionResponse { items }))
}

/// Graph hover, falling back to asking the build tool about labels the
/// graph does not know, such as external repositories.
pub async fn hover(State(state): AppState, Json(params): Json<PositionParams>) -> ServerResult<Json<HoverResponse>> {
    let workspace = state.workspace().await?;
    let doc = document_at(&workspace, &params.path).await?;
    if let Some(hover) = workspace.coordinator.hover(&doc, params.position).await {
        return Ok(Json(HoverResponse { hover: Some(hover) }));
    }

    let line = params.position.line;
    let Some(token) = doc.line(line).and_then(|text| label_token_at(text, params.position.character)) else {
        return Ok(Json(HoverResponse { hover: None }));
    };
    if !(token.text.starts_with("//") || token.text.starts_with('@')) {
        return Ok(Json(HoverResponse { hover: None }));
    }
    let hover = match workspace.client.target_info(&token.text).await {
        Ok(info) => {
            let mut contents = format!("**{}** `{}`", info.kind, info.label);
            if !info.visibility.is_empty() {
                contents.push_str(&format!("\n\nVisibility: {}", info.visibility.join(", ")));
            }
            let range = Range::new(Position::new(line, token.start), Position::new(line, token.end));
            Some(Hover { contents, range: Some(range) })
        }
        Err(err) => {
            debug!("No build tool info for {}: {}", token.text, err);
            None
        }
    };
    Ok(Json(HoverResponse { hover }))
}

// ── Build tool ──────────────────────────────────────────────

pub async fn query(State(state): AppState, Json(params): Json<QueryParams>) -> ServerResult<Json<QueryResult>> {
    let workspace = state.workspace().await?;
    let result = workspace.client.query(&params.expression).await?;
    Ok(Json(QueryResult::clone(&result)))
}

pub async fn start_command(
    State(state): AppState,
    Path(action): Path<ActionKind>,
    Json(params): Json<CommandParams>,
) -> ServerResult<Json<InvocationStarted>> {
    if params.target.trim().is_empty() {
        return Err(ServerError::BadRequest("`target` is required".to_string()));
    }
    let request = InvocationRequest {
        action,
        target: params.target,
        flags: params.flags,
        run_args: params.run_args,
    };
    let invocation_id = state.start_invocation(request).await?;
    Ok(Json(InvocationStarted { invocation_id }))
}

pub async fn cancel_command(State(state): AppState, Path(invocation_id): Path<u64>) -> ServerResult<Json<CancelResponse>> {
    if state.cancel_invocation(invocation_id) {
        Ok(Json(CancelResponse { invocation_id, cancelled: true }))
    } else {
        Err(ServerError::NotFound(format!("no running invocation {invocation_id}")))
    }
}
