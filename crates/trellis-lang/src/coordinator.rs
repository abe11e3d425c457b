//! Routes editor requests: the build graph first, then the language's
//! engine, then import rewriting back into the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use trellis_core::{
    BuildGraph, Label, LanguageEngineError, Location, Position, Range, Settings, SharedGraph, Target, is_build_file,
    package_for_build_file, package_of,
};

use crate::adapter::LanguageAdapter;
use crate::adapters::{create_adapter, language_for_path};
use crate::protocol::{CompletionItem, CompletionKind, DocumentRef, Hover};
use crate::supervisor::EngineStatus;
use crate::text::{Token, label_token_at, string_literal_at, string_prefix_at, word_prefix_at};

/// Functions that are always callable in a build file.
const BUILTINS: &[&str] = &["load", "glob", "select", "package", "exports_files", "licenses"];
const MAX_LABEL_COMPLETIONS: usize = 200;

pub struct LanguageCoordinator {
    root: PathBuf,
    graph: SharedGraph,
    build_file_names: Vec<String>,
    rule_kinds: Vec<String>,
    adapters: HashMap<String, Arc<dyn LanguageAdapter>>,
}

impl LanguageCoordinator {
    /// One adapter per configured language. Engines start on first use.
    pub fn new(root: impl Into<PathBuf>, graph: SharedGraph, settings: &Settings) -> Self {
        let root = root.into();
        let adapters = settings
            .languages
            .iter()
            .filter_map(|(id, language)| create_adapter(id, &root, language).map(|a| (id.clone(), a)))
            .collect();
        LanguageCoordinator {
            root,
            graph,
            build_file_names: settings.scanner.build_file_names.clone(),
            rule_kinds: settings.rules.kinds.clone(),
            adapters,
        }
    }

    /// Install or replace the adapter for its language id.
    pub fn with_adapter(mut self, adapter: Arc<dyn LanguageAdapter>) -> Self {
        self.adapters.insert(adapter.language_id().to_string(), adapter);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn adapter(&self, language_id: &str) -> Option<&Arc<dyn LanguageAdapter>> {
        self.adapters.get(language_id)
    }

    fn adapter_for(&self, path: &Path) -> Option<&Arc<dyn LanguageAdapter>> {
        self.adapters.get(language_for_path(path)?)
    }

    pub fn language_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    fn is_build_file(&self, path: &Path) -> bool {
        is_build_file(path, &self.build_file_names)
    }

    // ── Definition ──────────────────────────────────────────

    pub async fn resolve_definition(&self, doc: &DocumentRef, position: Position) -> Option<Location> {
        let line = doc.line(position.line)?;

        if let Some(location) = self.definition_from_graph(doc, line, position).await {
            return Some(location);
        }

        let adapter = self.adapter_for(&doc.path)?;
        if adapter.capabilities().definition {
            match adapter.definition(doc, position).await {
                Ok(Some(location)) => return Some(location),
                Ok(None) => {}
                Err(err) => log_engine_error(adapter.language_id(), "definition", &err),
            }
        }

        let candidates = adapter.workspace_import(line, position.character);
        if candidates.is_empty() {
            return None;
        }
        debug!("Resolving {} import via the graph: {:?}", adapter.language_id(), candidates);
        let graph = self.graph.read().await;
        self.resolve_import(&graph, &candidates)
    }

    /// A label (or, in a build file, any string naming a target or file)
    /// under the cursor.
    async fn definition_from_graph(&self, doc: &DocumentRef, line: &str, position: Position) -> Option<Location> {
        let (label, _) = self.label_at(doc, line, position)?;
        let graph = self.graph.read().await;
        if let Some(target) = graph.target(&label) {
            return Some(target.location.clone());
        }
        // Not a target: a source file label, or a `.bzl` file in a load().
        if !label.is_main_repo() {
            return None;
        }
        let path = self.root.join(label.package()).join(label.name());
        path.is_file().then(|| Location { path, range: Range::default() })
    }

    fn label_at(&self, doc: &DocumentRef, line: &str, position: Position) -> Option<(Label, Token)> {
        if self.is_build_file(&doc.path) {
            let package = package_for_build_file(&self.root, &doc.path)?;
            let token = label_token_at(line, position.character).or_else(|| string_literal_at(line, position.character))?;
            let label = Label::parse_relative(&token.text, &package).ok()?;
            return Some((label, token));
        }
        let token = label_token_at(line, position.character)?;
        if !(token.text.starts_with("//") || token.text.starts_with('@')) {
            return None;
        }
        Some((Label::parse(&token.text).ok()?, token))
    }

    /// First candidate that maps to a target: the owner of an existing file,
    /// else the first target of the nearest package enclosing a candidate.
    fn resolve_import(&self, graph: &BuildGraph, candidates: &[PathBuf]) -> Option<Location> {
        let existing: Vec<PathBuf> =
            candidates.iter().map(|c| self.root.join(c)).filter(|p| p.exists()).collect();

        for path in existing.iter().filter(|p| p.is_file()) {
            if let Some(target) = graph.target_for_file(path) {
                return Some(target.location.clone());
            }
        }

        for path in &existing {
            let dir = if path.is_dir() { path.as_path() } else { path.parent()? };
            if let Some(target) = self.nearest_package_target(graph, dir) {
                return Some(target.location.clone());
            }
        }

        existing
            .into_iter()
            .find(|p| p.is_file())
            .map(|path| Location { path, range: Range::default() })
    }

    fn nearest_package_target<'g>(&self, graph: &'g BuildGraph, dir: &Path) -> Option<&'g Target> {
        let mut current = Some(dir);
        while let Some(dir) = current {
            let package = package_of(&self.root, dir)?;
            if let Some(target) = graph.targets_in_package(&package).into_iter().next() {
                return Some(target);
            }
            current = dir.parent();
        }
        None
    }

    // ── Completion ──────────────────────────────────────────

    pub async fn completion(&self, doc: &DocumentRef, position: Position) -> Vec<CompletionItem> {
        if self.is_build_file(&doc.path) {
            let line = doc.line(position.line).unwrap_or_default();
            return self.build_file_completion(doc, line, position).await;
        }

        let Some(adapter) = self.adapter_for(&doc.path) else {
            return Vec::new();
        };
        if !adapter.capabilities().completion {
            return Vec::new();
        }
        match adapter.completion(doc, position).await {
            Ok(items) => items,
            Err(err) => {
                log_engine_error(adapter.language_id(), "completion", &err);
                Vec::new()
            }
        }
    }

    async fn build_file_completion(&self, doc: &DocumentRef, line: &str, position: Position) -> Vec<CompletionItem> {
        let graph = self.graph.read().await;

        if let Some(prefix) = string_prefix_at(line, position.character) {
            if prefix.starts_with("//") {
                return graph
                    .all_targets()
                    .into_iter()
                    .map(|t| (t.label.to_string(), t))
                    .filter(|(label, _)| label.starts_with(&prefix))
                    .take(MAX_LABEL_COMPLETIONS)
                    .map(|(label, t)| CompletionItem::new(label, CompletionKind::Label).with_detail(t.kind.clone()))
                    .collect();
            }
            let Some(package) = package_for_build_file(&self.root, &doc.path) else {
                return Vec::new();
            };
            let name_prefix = prefix.trim_start_matches(':');
            return graph
                .targets_in_package(&package)
                .into_iter()
                .filter(|t| t.label.name().starts_with(name_prefix))
                .map(|t| {
                    CompletionItem::new(format!(":{}", t.label.name()), CompletionKind::Label)
                        .with_detail(t.kind.clone())
                })
                .collect();
        }

        let prefix = word_prefix_at(line, position.character);
        let mut kinds: BTreeSet<&str> = self.rule_kinds.iter().map(String::as_str).collect();
        let seen: Vec<&Target> = graph.all_targets();
        kinds.extend(seen.iter().map(|t| t.kind.as_str()));

        let mut items: Vec<CompletionItem> = kinds
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .map(|k| CompletionItem::new(k, CompletionKind::Rule))
            .collect();
        items.extend(
            BUILTINS
                .iter()
                .filter(|b| b.starts_with(prefix))
                .map(|b| CompletionItem::new(*b, CompletionKind::Function)),
        );
        items
    }

    // ── Hover ───────────────────────────────────────────────

    pub async fn hover(&self, doc: &DocumentRef, position: Position) -> Option<Hover> {
        let line = doc.line(position.line).unwrap_or_default();
        let graph = self.graph.read().await;

        if let Some((label, token)) = self.label_at(doc, line, position) {
            if let Some(target) = graph.target(&label) {
                let range = Range::new(
                    Position::new(position.line, token.start),
                    Position::new(position.line, token.end),
                );
                return Some(Hover { contents: describe(target), range: Some(range) });
            }
        }

        if self.is_build_file(&doc.path) {
            let target = graph.target_at_position(&doc.path, position)?;
            return Some(Hover { contents: describe(target), range: Some(target.location.range) });
        }
        None
    }

    // ── Lifecycle ───────────────────────────────────────────

    pub async fn statuses(&self) -> BTreeMap<String, EngineStatus> {
        let mut statuses = BTreeMap::new();
        for (id, adapter) in &self.adapters {
            statuses.insert(id.clone(), adapter.status().await);
        }
        statuses
    }

    pub async fn shutdown(&self) {
        for adapter in self.adapters.values() {
            adapter.shutdown().await;
        }
    }
}

fn describe(target: &Target) -> String {
    let mut out = format!("**{}** `{}`\n\nPackage: `//{}`", target.kind, target.label, target.package);
    let list = |items: Vec<String>| items.iter().map(|i| format!("`{i}`")).collect::<Vec<_>>().join(", ");
    if !target.sources.is_empty() {
        out.push_str(&format!("\n\nSources: {}", list(target.sources.clone())));
    }
    if !target.dependencies.is_empty() {
        out.push_str(&format!(
            "\n\nDeps: {}",
            list(target.dependencies.iter().map(|d| d.to_string()).collect())
        ));
    }
    out
}

fn log_engine_error(language_id: &str, request: &str, err: &LanguageEngineError) {
    match err {
        LanguageEngineError::Disabled(_) | LanguageEngineError::BackingOff { .. } => {
            debug!("{} {} skipped: {}", language_id, request, err)
        }
        _ => warn!("{} {} failed: {}", language_id, request, err),
    }
}
