//! Explicitly owned server state shared by every handler

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_buildtool::{BuildToolClient, InvocationRequest};
use trellis_core::{BuildGraph, CancelToken, Settings, find_workspace_root};
use trellis_indexer::WorkspaceScanner;
use trellis_lang::LanguageCoordinator;
use trellis_watcher::{ChangeHook, ChangeScope, ScanSummary, WorkspaceEvent, WorkspaceService};

use crate::error::{ServerError, ServerResult};
use crate::websocket::ServerMessage;

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub definition: bool,
    pub completion: bool,
    pub hover: bool,
    pub commands: Vec<&'static str>,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitializeResult {
    pub root: PathBuf,
    pub capabilities: Capabilities,
    pub scan: ScanSummary,
}

/// Everything bound to one initialized root.
pub struct Workspace {
    pub root: PathBuf,
    pub settings: Settings,
    pub service: Arc<WorkspaceService>,
    pub client: Arc<BuildToolClient>,
    pub coordinator: Arc<LanguageCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl Workspace {
    /// Absolute form of a client-supplied path; relative paths are taken
    /// from the root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() { path.to_path_buf() } else { self.root.join(path) }
    }

    /// Editor text when the document is open, otherwise the file on disk.
    pub async fn document_text(&self, path: &Path) -> ServerResult<(String, i32)> {
        if let Some(doc) = self.service.documents().get(path) {
            return Ok((doc.text, doc.version));
        }
        tokio::fs::read_to_string(path)
            .await
            .map(|text| (text, 0))
            .map_err(|e| ServerError::NotFound(format!("{}: {}", path.display(), e)))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct ServerState {
    workspace: RwLock<Option<Arc<Workspace>>>,
    /// JSON notifications for every connected WebSocket client.
    pub notify_tx: broadcast::Sender<String>,
    /// Settings layered under the workspace's own file, e.g. from the CLI.
    overrides: Value,
    watch: bool,
    invocations: DashMap<u64, CancelToken>,
    next_invocation: AtomicU64,
}

impl ServerState {
    pub fn new(overrides: Value, watch: bool) -> Self {
        let (notify_tx, _) = broadcast::channel(1024);
        ServerState {
            workspace: RwLock::new(None),
            notify_tx,
            overrides,
            watch,
            invocations: DashMap::new(),
            next_invocation: AtomicU64::new(1),
        }
    }

    /// Broadcast a raw message to every client.
    pub fn broadcast(&self, message: String) -> Result<usize, broadcast::error::SendError<String>> {
        self.notify_tx.send(message)
    }

    pub fn notify(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            // No subscribers is not an error.
            Ok(json) => {
                let _ = self.notify_tx.send(json);
            }
            Err(err) => warn!("Failed to serialize notification: {}", err),
        }
    }

    pub async fn workspace(&self) -> ServerResult<Arc<Workspace>> {
        self.workspace.read().await.clone().ok_or(ServerError::WorkspaceNotSet)
    }

    pub async fn current_root(&self) -> Option<PathBuf> {
        self.workspace.read().await.as_ref().map(|w| w.root.clone())
    }

    /// Bind the server to `root`: load settings, scan, start the watcher.
    /// A previously initialized workspace is shut down first.
    pub async fn initialize(&self, root: &Path, options: &Value) -> ServerResult<InitializeResult> {
        let root = find_workspace_root(root);
        let mut settings = Settings::load(&root)?;
        settings.apply_overrides(&self.overrides)?;
        settings.apply_overrides(options)?;
        info!("Initializing workspace at {}", root.display());

        if let Some(previous) = self.workspace.write().await.take() {
            self.shutdown_workspace(&previous).await;
        }

        let graph = BuildGraph::new(&root).into_shared();
        let scanner = WorkspaceScanner::new(&root, settings.clone())?;
        let client = Arc::new(BuildToolClient::new(&root, settings.build_tool.clone()));

        let hook_client = Arc::clone(&client);
        let hook: ChangeHook = Arc::new(move |scope: &ChangeScope| match scope {
            ChangeScope::Path(path) => {
                let dropped = hook_client.invalidate_path(path);
                if dropped > 0 {
                    debug!("Invalidated {} cached queries for {}", dropped, path.display());
                }
            }
            ChangeScope::Workspace => hook_client.invalidate_all(),
        });

        let (events_tx, _) = broadcast::channel(256);
        let service = Arc::new(
            WorkspaceService::new(scanner, Arc::clone(&graph))
                .with_broadcast(events_tx.clone())
                .with_change_hook(hook),
        );
        let coordinator = Arc::new(LanguageCoordinator::new(&root, graph, &settings));

        let mut tasks = vec![self.forward_events(events_tx.subscribe())];
        let scan = service.full_scan(CancelToken::new()).await?;
        if self.watch {
            tasks.push(Arc::clone(&service).watch()?);
        }

        let capabilities = Capabilities {
            definition: true,
            completion: true,
            hover: true,
            commands: vec!["build", "test", "run"],
            languages: coordinator.language_ids().into_iter().map(str::to_string).collect(),
        };
        let workspace = Arc::new(Workspace { root: root.clone(), settings, service, client, coordinator, tasks });
        *self.workspace.write().await = Some(workspace);

        Ok(InitializeResult { root, capabilities, scan })
    }

    fn forward_events(&self, mut events: broadcast::Receiver<WorkspaceEvent>) -> JoinHandle<()> {
        let notify_tx = self.notify_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => {
                            let _ = notify_tx.send(json);
                        }
                        Err(err) => warn!("Failed to serialize workspace event: {}", err),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification forwarder lagged; {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ── Invocations ─────────────────────────────────────────

    /// Start `request` in the background. Progress and the final report are
    /// pushed as notifications under the returned id.
    pub async fn start_invocation(self: &Arc<Self>, request: InvocationRequest) -> ServerResult<u64> {
        let workspace = self.workspace().await?;
        let id = self.next_invocation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelToken::new();
        self.invocations.insert(id, cancel.clone());

        let state = Arc::clone(self);
        tokio::spawn(async move {
            let sink = Arc::clone(&state);
            let outcome = workspace
                .client
                .invoke(&request, cancel, move |event| {
                    sink.notify(&ServerMessage::InvocationEvent { invocation_id: id, event })
                })
                .await;
            state.invocations.remove(&id);
            match outcome {
                Ok(report) => state.notify(&ServerMessage::InvocationFinished { invocation_id: id, report }),
                Err(err) => {
                    warn!("Invocation {} failed to run: {}", id, err);
                    state.notify(&ServerMessage::InvocationFailed { invocation_id: id, error: err.to_string() })
                }
            }
        });
        Ok(id)
    }

    /// Signal cancellation. False when `id` is unknown or already done.
    pub fn cancel_invocation(&self, id: u64) -> bool {
        match self.invocations.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_invocations(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.invocations.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    async fn shutdown_workspace(&self, workspace: &Workspace) {
        for entry in self.invocations.iter() {
            entry.value().cancel();
        }
        workspace.coordinator.shutdown().await;
        for task in &workspace.tasks {
            task.abort();
        }
    }

    pub async fn shutdown(&self) {
        if let Some(workspace) = self.workspace.write().await.take() {
            info!("Shutting down workspace {}", workspace.root.display());
            self.shutdown_workspace(&workspace).await;
        }
    }
}
