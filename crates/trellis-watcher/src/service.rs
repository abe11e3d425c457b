//! Keeps the shared build graph in step with the editor and the disk
//!
//! Every write follows the same path: parse one file off the async runtime,
//! swap its contribution into the graph under the write lock, run the change
//! hooks (query cache invalidation), then broadcast what changed.
//!
//! Writes are ordered per file by a generation taken when the write is
//! issued. A parse that finishes after a newer write to the same file has
//! been applied is discarded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_core::{CancelToken, ConfigFile, Diagnostic, GraphChange, Label, SharedGraph};
use trellis_indexer::WorkspaceScanner;

use crate::documents::{Document, DocumentStore};
use crate::watcher::{FileWatcher, WatchEvent};

/// Notifications about the graph, serialized onto the client channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkspaceEvent {
    TargetsChanged {
        files: Vec<PathBuf>,
        label_count: usize,
        added: Vec<Label>,
        removed: Vec<Label>,
        updated: Vec<Label>,
    },
    ScanFinished(ScanSummary),
    Diagnostics {
        file: PathBuf,
        diagnostics: Vec<Diagnostic>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    pub files_scanned: usize,
    pub label_count: usize,
    pub diagnostic_count: usize,
    pub elapsed_ms: u64,
}

/// What a change hook is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeScope {
    /// One file changed on disk or in the editor.
    Path(PathBuf),
    /// The whole workspace was rescanned.
    Workspace,
}

pub type ChangeHook = Arc<dyn Fn(&ChangeScope) + Send + Sync>;

pub struct WorkspaceService {
    scanner: Arc<WorkspaceScanner>,
    graph: SharedGraph,
    documents: DocumentStore,
    events: broadcast::Sender<WorkspaceEvent>,
    hooks: Vec<ChangeHook>,
    next_generation: AtomicU64,
    /// Newest generation written to the graph, per build file.
    applied: DashMap<PathBuf, u64>,
}

impl WorkspaceService {
    pub fn new(scanner: WorkspaceScanner, graph: SharedGraph) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            scanner: Arc::new(scanner),
            graph,
            documents: DocumentStore::new(),
            events,
            hooks: Vec::new(),
            next_generation: AtomicU64::new(1),
            applied: DashMap::new(),
        }
    }

    /// Publish events on an existing channel instead of a private one.
    pub fn with_broadcast(mut self, events: broadcast::Sender<WorkspaceEvent>) -> Self {
        self.events = events;
        self
    }

    /// Run `hook` synchronously after every write, before the change is
    /// broadcast.
    pub fn with_change_hook(mut self, hook: ChangeHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn root(&self) -> &Path {
        self.scanner.root()
    }

    pub fn scanner(&self) -> &WorkspaceScanner {
        &self.scanner
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.events.subscribe()
    }

    // ── Full scan ───────────────────────────────────────────

    /// Rescan the workspace on a blocking thread and swap the result in.
    /// Open build documents are re-applied on top of the fresh graph so
    /// unsaved edits survive.
    pub async fn full_scan(&self, cancel: CancelToken) -> Result<ScanSummary> {
        let scanner = Arc::clone(&self.scanner);
        let report = tokio::task::spawn_blocking(move || scanner.scan(&cancel))
            .await
            .context("scan task panicked")??;

        let summary = ScanSummary {
            files_scanned: report.files_scanned,
            label_count: report.graph.target_count(),
            diagnostic_count: report.diagnostics.len(),
            elapsed_ms: report.elapsed.as_millis() as u64,
        };

        {
            let mut graph = self.graph.write().await;
            *graph = report.graph;
        }
        self.run_hooks(&ChangeScope::Workspace);

        for path in self.documents.paths() {
            if !self.scanner.is_build_file(&path) {
                continue;
            }
            if let Some(text) = self.documents.text(&path) {
                self.update_file(&path, text).await;
            }
        }

        let mut by_file: Vec<(PathBuf, Vec<Diagnostic>)> = Vec::new();
        for (file, diagnostic) in report.diagnostics {
            match by_file.last_mut() {
                Some((last, diagnostics)) if *last == file => diagnostics.push(diagnostic),
                _ => by_file.push((file, vec![diagnostic])),
            }
        }
        for (file, diagnostics) in by_file {
            self.publish(WorkspaceEvent::Diagnostics { file, diagnostics });
        }
        self.publish(WorkspaceEvent::ScanFinished(summary.clone()));
        Ok(summary)
    }

    // ── Per-file updates ────────────────────────────────────

    /// Re-parse exactly one file and swap its contribution into the graph.
    /// Identical content is a no-op. Non-build files only run the change
    /// hooks.
    pub async fn update_file(&self, path: &Path, text: String) -> GraphChange {
        if !self.scanner.is_build_file(path) {
            self.run_hooks(&ChangeScope::Path(path.to_path_buf()));
            return GraphChange::default();
        }
        let generation = self.issue_generation();

        let hash = ConfigFile::content_hash(&text);
        let unchanged = {
            let graph = self.graph.read().await;
            graph.config_file(path).is_some_and(|f| f.content_hash == hash && f.text == text)
        };
        if unchanged {
            // Still the newest write: older parses in flight must not land.
            self.claim_generation(path, generation);
            debug!("Skipping unchanged build file {}", path.display());
            return GraphChange::default();
        }

        let scanner = Arc::clone(&self.scanner);
        let owned = path.to_path_buf();
        let contribution =
            match tokio::task::spawn_blocking(move || scanner.extractor().extract(&owned, &text)).await {
                Ok(contribution) => contribution,
                Err(err) => {
                    warn!("Parsing {} failed: {}", path.display(), err);
                    return GraphChange::default();
                }
            };

        let (change, label_count, diagnostics) = {
            let mut graph = self.graph.write().await;
            if !self.claim_generation(path, generation) {
                debug!("Discarding stale parse of {} (generation {})", path.display(), generation);
                return GraphChange::default();
            }
            let change = graph.apply_file(contribution);
            (change, graph.target_count(), graph.diagnostics_for(path))
        };
        self.after_write(path, change, label_count, diagnostics)
    }

    /// Drop a deleted build file, or every build file under a deleted
    /// directory.
    pub async fn remove_file(&self, path: &Path) -> GraphChange {
        let generation = self.issue_generation();
        let (change, label_count) = {
            let mut graph = self.graph.write().await;
            let doomed: Vec<PathBuf> =
                graph.config_files().map(|f| f.path.clone()).filter(|p| p.starts_with(path)).collect();
            let mut change = GraphChange::default();
            for file in doomed {
                if self.claim_generation(&file, generation) {
                    change.merge(graph.remove_file(&file));
                }
            }
            (change, graph.target_count())
        };
        self.after_write(path, change, label_count, Vec::new())
    }

    /// Re-read `path` from disk unless the editor owns it.
    pub async fn reload_file(&self, path: &Path) -> GraphChange {
        if self.documents.is_open(path) {
            return GraphChange::default();
        }
        if !self.scanner.is_build_file(path) {
            self.run_hooks(&ChangeScope::Path(path.to_path_buf()));
            return GraphChange::default();
        }
        match tokio::fs::read_to_string(path).await {
            Ok(text) => self.update_file(path, text).await,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => self.remove_file(path).await,
            Err(err) => {
                warn!("Failed to read {}: {}", path.display(), err);
                GraphChange::default()
            }
        }
    }

    fn after_write(
        &self,
        path: &Path,
        change: GraphChange,
        label_count: usize,
        diagnostics: Vec<Diagnostic>,
    ) -> GraphChange {
        self.run_hooks(&ChangeScope::Path(path.to_path_buf()));
        if change.files.is_empty() {
            return change;
        }
        if self.scanner.is_build_file(path) {
            self.publish(WorkspaceEvent::Diagnostics { file: path.to_path_buf(), diagnostics });
        }
        if !change.is_empty() {
            info!(
                "{}: +{} -{} ~{} targets",
                path.display(),
                change.added.len(),
                change.removed.len(),
                change.updated.len()
            );
            self.publish(WorkspaceEvent::TargetsChanged {
                files: change.files.clone(),
                label_count,
                added: change.added.clone(),
                removed: change.removed.clone(),
                updated: change.updated.clone(),
            });
        }
        change
    }

    // ── Editor notifications ────────────────────────────────

    pub async fn did_open(&self, path: &Path, text: String) -> Document {
        let document = self.documents.open(path, text.clone());
        self.update_file(path, text).await;
        document
    }

    pub async fn did_change(&self, path: &Path, text: String) -> Document {
        let document = self.documents.change(path, text.clone());
        self.update_file(path, text).await;
        document
    }

    /// A save carries the saved text when the editor sends it; otherwise
    /// the disk copy is authoritative.
    pub async fn did_save(&self, path: &Path, text: Option<String>) -> GraphChange {
        match text {
            Some(text) => {
                if self.documents.is_open(path) {
                    self.documents.change(path, text.clone());
                }
                self.update_file(path, text).await
            }
            None => match self.documents.text(path) {
                Some(text) => self.update_file(path, text).await,
                None => self.reload_file(path).await,
            },
        }
    }

    /// Forget the editor's copy; unsaved edits are discarded in favor of
    /// the disk.
    pub async fn did_close(&self, path: &Path) -> GraphChange {
        self.documents.close(path);
        self.reload_file(path).await
    }

    // ── Disk watching ───────────────────────────────────────

    /// Watch the workspace root and apply changes made outside the editor
    /// until the returned task is aborted.
    pub fn watch(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let prefixes = self.scanner.settings().scanner.exclude_prefixes.clone();
        let mut watcher = FileWatcher::new(self.root(), prefixes)?;
        watcher.watch_directory(self.root())?;
        info!("Started watching workspace: {:?}", self.root());

        Ok(tokio::spawn(async move {
            while let Some(event) = watcher.next_event().await {
                self.handle_watch_event(event).await;
            }
        }))
    }

    pub async fn handle_watch_event(&self, event: WatchEvent) -> GraphChange {
        debug!("Processing watch event: {:?}", event);
        match event {
            WatchEvent::Created(path) | WatchEvent::Modified(path) => {
                if path.is_dir() {
                    return GraphChange::default();
                }
                self.reload_file(&path).await
            }
            WatchEvent::Removed(path) => {
                if self.documents.is_open(&path) {
                    return GraphChange::default();
                }
                self.remove_file(&path).await
            }
        }
    }

    pub(crate) fn issue_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Record `generation` as the newest write to `path`. False when a newer
    /// write already got there.
    pub(crate) fn claim_generation(&self, path: &Path, generation: u64) -> bool {
        let mut applied = self.applied.entry(path.to_path_buf()).or_insert(0);
        if *applied > generation {
            return false;
        }
        *applied = generation;
        true
    }

    fn run_hooks(&self, scope: &ChangeScope) {
        for hook in &self.hooks {
            hook(scope);
        }
    }

    fn publish(&self, event: WorkspaceEvent) {
        // No receivers just means no client is connected.
        let _ = self.events.send(event);
    }
}
