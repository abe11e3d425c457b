//! Build graph: targets keyed by label plus the file and dependency indices
//!
//! Writers hold `&mut BuildGraph` (behind the `SharedGraph` write lock) and
//! apply one file's contribution at a time, so a reader never sees a target
//! in one index but missing from the other.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use serde::{Deserialize, Serialize};

use crate::label::Label;
use crate::model::*;

/// The graph as shared between request handlers.
pub type SharedGraph = Arc<tokio::sync::RwLock<BuildGraph>>;

/// What one write did to the set of targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphChange {
    pub files: Vec<PathBuf>,
    pub added: Vec<Label>,
    pub removed: Vec<Label>,
    pub updated: Vec<Label>,
}

impl GraphChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    pub fn merge(&mut self, other: GraphChange) {
        self.files.extend(other.files);
        self.added.extend(other.added);
        self.removed.extend(other.removed);
        self.updated.extend(other.updated);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Build,
    Test,
    Run,
}

/// An action offered on a target's declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAction {
    pub label: Label,
    pub action: ActionKind,
    pub range: Range,
}

/// A dependency naming no known target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanglingReference {
    pub from: Label,
    pub missing: Label,
    pub location: Location,
}

/// Dependency edges `dependent -> dependency`, built on first use.
struct DependencyIndex {
    graph: DiGraph<Label, ()>,
    nodes: HashMap<Label, NodeIndex>,
}

impl DependencyIndex {
    fn build(targets: &HashMap<Label, Target>) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes: HashMap<Label, NodeIndex> = HashMap::new();

        let mut node_for = |graph: &mut DiGraph<Label, ()>, label: &Label| {
            *nodes.entry(label.clone()).or_insert_with(|| graph.add_node(label.clone()))
        };

        for target in targets.values().filter(|t| t.indexed) {
            let from = node_for(&mut graph, &target.label);
            for dep in &target.dependencies {
                let to = node_for(&mut graph, dep);
                graph.add_edge(from, to, ());
            }
        }

        DependencyIndex { graph, nodes }
    }

    fn direct_dependents(&self, label: &Label) -> Vec<Label> {
        let Some(&node) = self.nodes.get(label) else {
            return Vec::new();
        };
        let mut out: Vec<Label> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    fn transitive_dependents(&self, label: &Label) -> Vec<Label> {
        let Some(&start) = self.nodes.get(label) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut out = Vec::new();
        while let Some(node) = bfs.next(reversed) {
            if node != start {
                out.push(self.graph[node].clone());
            }
        }
        out.sort();
        out
    }
}

/// A target's `glob` sources, compiled. Consulted only when no target
/// names a file explicitly.
struct GlobClaim {
    label: Label,
    directory: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl GlobClaim {
    fn compile(label: &Label, glob: &SourceGlob) -> Result<Self, globset::Error> {
        Ok(GlobClaim {
            label: label.clone(),
            directory: glob.directory.clone(),
            include: glob_set(&glob.include)?,
            exclude: glob_set(&glob.exclude)?,
        })
    }

    fn matches(&self, relative: &Path) -> bool {
        self.include.is_match(relative) && !self.exclude.is_match(relative)
    }
}

/// `*` stops at `/`; `**` crosses directories.
fn glob_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
    }
    builder.build()
}

/// All targets of one workspace and the indices derived from them.
pub struct BuildGraph {
    root: PathBuf,
    targets: HashMap<Label, Target>,
    files: HashMap<PathBuf, ConfigFile>,
    /// Source file -> labels declaring it in a source attribute.
    file_index: HashMap<PathBuf, Vec<Label>>,
    glob_index: Vec<GlobClaim>,
    dependency_index: OnceLock<DependencyIndex>,
}

impl std::fmt::Debug for BuildGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildGraph")
            .field("root", &self.root)
            .field("targets", &self.targets.len())
            .field("files", &self.files.len())
            .finish()
    }
}

impl BuildGraph {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BuildGraph {
            root: root.into(),
            targets: HashMap::new(),
            files: HashMap::new(),
            file_index: HashMap::new(),
            glob_index: Vec::new(),
            dependency_index: OnceLock::new(),
        }
    }

    pub fn into_shared(self) -> SharedGraph {
        Arc::new(tokio::sync::RwLock::new(self))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    // ── Writes ──────────────────────────────────────────────

    /// Replace everything `contribution.file.path` previously contributed.
    /// Re-applying identical content is a no-op and returns an empty change.
    pub fn apply_file(&mut self, contribution: FileContribution) -> GraphChange {
        let FileContribution { mut file, targets } = contribution;
        let path = file.path.clone();

        let unchanged = self
            .files
            .get(&path)
            .is_some_and(|existing| existing.content_hash == file.content_hash && existing.text == file.text);
        if unchanged {
            return GraphChange::default();
        }

        let previous = self.detach_file(&path);

        let mut labels = Vec::with_capacity(targets.len());
        for target in targets {
            if let Some(owner) = self.targets.get(&target.label) {
                file.diagnostics.push(Diagnostic::warning(
                    DiagnosticKind::DuplicateTarget,
                    format!(
                        "target {} is already declared in {}",
                        target.label,
                        owner.location.path.display()
                    ),
                    target.location.range,
                ));
                continue;
            }
            labels.push(target.label.clone());
            self.insert_target(target);
        }
        file.labels = labels;
        self.files.insert(path.clone(), file);
        self.dependency_index = OnceLock::new();

        self.diff(path, previous)
    }

    /// Drop a deleted configuration file's contribution.
    pub fn remove_file(&mut self, path: &Path) -> GraphChange {
        if !self.files.contains_key(path) {
            return GraphChange::default();
        }
        let previous = self.detach_file(path);
        self.dependency_index = OnceLock::new();
        self.diff(path.to_path_buf(), previous)
    }

    /// Remove a file's targets from both indices, returning them.
    fn detach_file(&mut self, path: &Path) -> Vec<Target> {
        let Some(file) = self.files.remove(path) else {
            return Vec::new();
        };
        let mut removed = Vec::with_capacity(file.labels.len());
        for label in &file.labels {
            if let Some(target) = self.targets.remove(label) {
                for source in &target.source_paths {
                    if let Some(claims) = self.file_index.get_mut(source) {
                        claims.retain(|l| l != label);
                        if claims.is_empty() {
                            self.file_index.remove(source);
                        }
                    }
                }
                if !target.source_globs.is_empty() {
                    self.glob_index.retain(|claim| claim.label != *label);
                }
                removed.push(target);
            }
        }
        removed
    }

    fn insert_target(&mut self, target: Target) {
        if target.indexed {
            for source in &target.source_paths {
                let claims = self.file_index.entry(source.clone()).or_default();
                if !claims.contains(&target.label) {
                    claims.push(target.label.clone());
                }
            }
            for glob in &target.source_globs {
                match GlobClaim::compile(&target.label, glob) {
                    Ok(claim) => self.glob_index.push(claim),
                    Err(err) => tracing::warn!("Ignoring glob sources of {}: {}", target.label, err),
                }
            }
        }
        self.targets.insert(target.label.clone(), target);
    }

    fn diff(&self, path: PathBuf, previous: Vec<Target>) -> GraphChange {
        let current: Vec<&Target> = self
            .files
            .get(&path)
            .map(|f| f.labels.iter().filter_map(|l| self.targets.get(l)).collect())
            .unwrap_or_default();

        let before: HashMap<&Label, &Target> = previous.iter().map(|t| (&t.label, t)).collect();
        let after: HashSet<&Label> = current.iter().map(|t| &t.label).collect();

        let mut change = GraphChange { files: vec![path], ..Default::default() };
        for target in &current {
            match before.get(&target.label) {
                None => change.added.push(target.label.clone()),
                Some(old) if !same_declaration(old, target) => {
                    change.updated.push(target.label.clone())
                }
                Some(_) => {}
            }
        }
        for old in &previous {
            if !after.contains(&old.label) {
                change.removed.push(old.label.clone());
            }
        }
        change
    }

    // ── Reads ───────────────────────────────────────────────

    pub fn target(&self, label: &Label) -> Option<&Target> {
        self.targets.get(label)
    }

    /// The target owning `path`. When several claim it, a non-test kind wins,
    /// then the earliest declaration (build file path, position in file).
    pub fn target_for_file(&self, path: &Path) -> Option<&Target> {
        self.targets_for_file(path).into_iter().next()
    }

    /// Every target claiming `path`, in tie-break order. Explicit source
    /// entries take precedence over `glob` patterns.
    pub fn targets_for_file(&self, path: &Path) -> Vec<&Target> {
        let mut claims: Vec<&Target> = match self.file_index.get(path) {
            Some(labels) => labels.iter().filter_map(|l| self.targets.get(l)).collect(),
            None => self.glob_claims(path),
        };
        claims.sort_by(|a, b| {
            (a.is_test(), &a.location.path, a.declaration_index)
                .cmp(&(b.is_test(), &b.location.path, b.declaration_index))
        });
        claims
    }

    fn glob_claims(&self, path: &Path) -> Vec<&Target> {
        let mut claims: Vec<&Target> = Vec::new();
        for claim in &self.glob_index {
            let Ok(relative) = path.strip_prefix(&claim.directory) else { continue };
            if !claim.matches(relative) || self.crosses_package(&claim.directory, path) {
                continue;
            }
            if let Some(target) = self.targets.get(&claim.label) {
                if !claims.iter().any(|t| t.label == target.label) {
                    claims.push(target);
                }
            }
        }
        claims
    }

    /// True if a build file sits in a directory strictly between
    /// `directory` and `path`; globs never reach into subpackages.
    fn crosses_package(&self, directory: &Path, path: &Path) -> bool {
        path.ancestors()
            .skip(1)
            .take_while(|dir| *dir != directory && dir.starts_with(directory))
            .any(|dir| self.files.keys().any(|file| file.parent() == Some(dir)))
    }

    /// Declared dependencies in declaration order; `None` for unknown labels.
    pub fn dependencies_of(&self, label: &Label) -> Option<&[Label]> {
        self.targets.get(label).map(|t| t.dependencies.as_slice())
    }

    /// Targets that depend on `label` directly, sorted.
    pub fn reverse_dependencies(&self, label: &Label) -> Vec<Label> {
        self.dependency_index().direct_dependents(label)
    }

    /// Targets that depend on `label` directly or through other targets.
    pub fn transitive_reverse_dependencies(&self, label: &Label) -> Vec<Label> {
        self.dependency_index().transitive_dependents(label)
    }

    fn dependency_index(&self) -> &DependencyIndex {
        self.dependency_index.get_or_init(|| DependencyIndex::build(&self.targets))
    }

    /// All targets sorted by label, unindexed kinds included.
    pub fn all_targets(&self) -> Vec<&Target> {
        let mut all: Vec<&Target> = self.targets.values().collect();
        all.sort_by(|a, b| a.label.cmp(&b.label));
        all
    }

    /// Targets declared by `build_file`, in declaration order.
    pub fn targets_in_file(&self, build_file: &Path) -> Vec<&Target> {
        self.files
            .get(build_file)
            .map(|f| f.labels.iter().filter_map(|l| self.targets.get(l)).collect())
            .unwrap_or_default()
    }

    pub fn targets_in_package(&self, package: &str) -> Vec<&Target> {
        let mut found: Vec<&Target> =
            self.targets.values().filter(|t| t.package == package).collect();
        found.sort_by_key(|t| t.declaration_index);
        found
    }

    pub fn config_file(&self, path: &Path) -> Option<&ConfigFile> {
        self.files.get(path)
    }

    pub fn config_files(&self) -> impl Iterator<Item = &ConfigFile> {
        self.files.values()
    }

    pub fn has_package(&self, package: &str) -> bool {
        self.files.values().any(|f| f.package == package)
    }

    /// The target whose declaring call spans `position` in `build_file`.
    pub fn target_at_position(&self, build_file: &Path, position: Position) -> Option<&Target> {
        self.targets_in_file(build_file)
            .into_iter()
            .find(|t| t.location.range.contains(position))
    }

    /// Declaration sites of every target depending on `label`.
    pub fn find_references(&self, label: &Label) -> Vec<Location> {
        self.reverse_dependencies(label)
            .iter()
            .filter_map(|l| self.targets.get(l))
            .map(|t| t.location.clone())
            .collect()
    }

    /// Main-repository dependencies that name no known target.
    pub fn dangling_references(&self) -> Vec<DanglingReference> {
        let mut dangling: Vec<DanglingReference> = self
            .targets
            .values()
            .filter(|t| t.indexed)
            .flat_map(|t| {
                t.dependencies
                    .iter()
                    .filter(|dep| dep.is_main_repo() && !self.targets.contains_key(dep))
                    .map(move |dep| DanglingReference {
                        from: t.label.clone(),
                        missing: dep.clone(),
                        location: t.location.clone(),
                    })
            })
            .collect();
        dangling.sort_by(|a, b| (&a.from, &a.missing).cmp(&(&b.from, &b.missing)));
        dangling
    }

    /// Parse diagnostics of `build_file` plus warnings for its dangling
    /// dependencies, resolved against the current graph.
    pub fn diagnostics_for(&self, build_file: &Path) -> Vec<Diagnostic> {
        let Some(file) = self.files.get(build_file) else {
            return Vec::new();
        };
        let mut out = file.diagnostics.clone();
        for target in self.targets_in_file(build_file).into_iter().filter(|t| t.indexed) {
            for dep in &target.dependencies {
                if dep.is_main_repo() && !self.targets.contains_key(dep) {
                    out.push(Diagnostic::warning(
                        DiagnosticKind::DanglingReference,
                        format!("{} depends on unknown target {}", target.label, dep),
                        target.location.range,
                    ));
                }
            }
        }
        out
    }

    /// Build/test/run actions for each target declared in `build_file`.
    pub fn code_lenses(&self, build_file: &Path) -> Vec<TargetAction> {
        let mut actions = Vec::new();
        for target in self.targets_in_file(build_file) {
            let range = target.location.range;
            actions.push(TargetAction { label: target.label.clone(), action: ActionKind::Build, range });
            if target.is_test() {
                actions.push(TargetAction { label: target.label.clone(), action: ActionKind::Test, range });
            } else if target.is_runnable() {
                actions.push(TargetAction { label: target.label.clone(), action: ActionKind::Run, range });
            }
        }
        actions
    }
}

fn same_declaration(a: &Target, b: &Target) -> bool {
    a.kind == b.kind
        && a.attributes == b.attributes
        && a.sources == b.sources
        && a.source_globs == b.source_globs
        && a.dependencies == b.dependencies
        && a.location == b.location
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{contribution, target};

    #[test]
    fn test_apply_and_lookup() {
        let mut graph = BuildGraph::new("/ws");
        let server = target("app", "server", "go_binary", &["main.go"], &[":lib"]);
        let lib = target("app", "lib", "go_library", &["lib.go"], &[]);
        let change = graph.apply_file(contribution("/ws/app/BUILD", "app", "v1", vec![server, lib]));

        assert_eq!(change.added.len(), 2);
        let owner = graph.target_for_file(Path::new("/ws/app/main.go")).unwrap();
        assert_eq!(owner.label.to_string(), "//app:server");

        let lib_label = Label::parse("//app:lib").unwrap();
        assert_eq!(graph.reverse_dependencies(&lib_label), vec![Label::parse("//app:server").unwrap()]);
    }

    #[test]
    fn test_identical_reapply_is_noop() {
        let mut graph = BuildGraph::new("/ws");
        let t = target("a", "x", "go_library", &["x.go"], &[]);
        graph.apply_file(contribution("/ws/a/BUILD", "a", "same", vec![t.clone()]));
        let change = graph.apply_file(contribution("/ws/a/BUILD", "a", "same", vec![t]));
        assert!(change.is_empty());
    }

    #[test]
    fn test_replace_moves_file_claims() {
        let mut graph = BuildGraph::new("/ws");
        let v1 = target("a", "x", "go_library", &["old.go"], &[]);
        graph.apply_file(contribution("/ws/a/BUILD", "a", "v1", vec![v1]));

        let v2 = target("a", "x", "go_library", &["new.go"], &[]);
        let change = graph.apply_file(contribution("/ws/a/BUILD", "a", "v2", vec![v2]));

        assert_eq!(change.updated, vec![Label::parse("//a:x").unwrap()]);
        assert!(graph.target_for_file(Path::new("/ws/a/old.go")).is_none());
        assert!(graph.target_for_file(Path::new("/ws/a/new.go")).is_some());
    }

    #[test]
    fn test_remove_file() {
        let mut graph = BuildGraph::new("/ws");
        let t = target("a", "x", "go_library", &["x.go"], &[]);
        graph.apply_file(contribution("/ws/a/BUILD", "a", "v1", vec![t]));

        let change = graph.remove_file(Path::new("/ws/a/BUILD"));
        assert_eq!(change.removed.len(), 1);
        assert_eq!(graph.target_count(), 0);
        assert!(graph.target_for_file(Path::new("/ws/a/x.go")).is_none());
        assert!(graph.remove_file(Path::new("/ws/a/BUILD")).is_empty());
    }

    #[test]
    fn test_glob_sources_claim_files() {
        let mut graph = BuildGraph::new("/ws");
        let mut lib = target("a", "lib", "go_library", &[], &[]);
        lib.source_globs.push(SourceGlob {
            directory: PathBuf::from("/ws/a"),
            include: vec!["*.go".to_string()],
            exclude: vec!["*_test.go".to_string()],
        });
        let explicit = target("a", "gen", "go_library", &["gen.go"], &[]);
        graph.apply_file(contribution("/ws/a/BUILD", "a", "v1", vec![lib, explicit]));
        graph.apply_file(contribution("/ws/a/sub/BUILD", "a/sub", "v1", vec![]));

        let owner = |graph: &BuildGraph, path: &str| graph.target_for_file(Path::new(path)).map(|t| t.label.to_string());
        assert_eq!(owner(&graph, "/ws/a/server.go").as_deref(), Some("//a:lib"));
        assert_eq!(owner(&graph, "/ws/a/gen.go").as_deref(), Some("//a:gen"));
        assert_eq!(owner(&graph, "/ws/a/server_test.go"), None);
        // `*` stops at directories, and subpackages are out of reach anyway.
        assert_eq!(owner(&graph, "/ws/a/deep/x.go"), None);
        assert_eq!(owner(&graph, "/ws/a/sub/x.go"), None);

        graph.remove_file(Path::new("/ws/a/BUILD"));
        assert_eq!(owner(&graph, "/ws/a/server.go"), None);
    }

    #[test]
    fn test_recursive_glob_stops_at_subpackage() {
        let mut graph = BuildGraph::new("/ws");
        let mut data = target("a", "data", "filegroup", &[], &[]);
        data.source_globs.push(SourceGlob {
            directory: PathBuf::from("/ws/a"),
            include: vec!["**/*.json".to_string()],
            exclude: vec![],
        });
        graph.apply_file(contribution("/ws/a/BUILD", "a", "v1", vec![data]));
        graph.apply_file(contribution("/ws/a/sub/BUILD", "a/sub", "v1", vec![]));

        assert!(graph.target_for_file(Path::new("/ws/a/x/y/config.json")).is_some());
        assert!(graph.target_for_file(Path::new("/ws/a/sub/config.json")).is_none());
    }

    #[test]
    fn test_tie_break_prefers_non_test_then_declaration_order() {
        let mut graph = BuildGraph::new("/ws");
        let mut test = target("a", "a_test", "go_test", &["a.go"], &[]);
        test.declaration_index = 0;
        let mut second = target("a", "second", "go_library", &["a.go"], &[]);
        second.declaration_index = 2;
        let mut first = target("a", "first", "go_library", &["a.go"], &[]);
        first.declaration_index = 1;
        graph.apply_file(contribution("/ws/a/BUILD", "a", "v", vec![test, second, first]));

        let order: Vec<String> = graph
            .targets_for_file(Path::new("/ws/a/a.go"))
            .iter()
            .map(|t| t.label.name().to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "a_test"]);
    }

    #[test]
    fn test_duplicate_across_files_first_wins() {
        let mut graph = BuildGraph::new("/ws");
        let original = target("a", "x", "go_library", &["x.go"], &[]);
        graph.apply_file(contribution("/ws/a/BUILD", "a", "one", vec![original]));

        let mut clash = target("a", "x", "go_library", &["y.go"], &[]);
        clash.location.path = PathBuf::from("/ws/a/BUILD.bazel");
        graph.apply_file(contribution("/ws/a/BUILD.bazel", "a", "two", vec![clash]));

        let diagnostics = graph.diagnostics_for(Path::new("/ws/a/BUILD.bazel"));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::DuplicateTarget);
        assert!(graph.target_for_file(Path::new("/ws/a/y.go")).is_none());
    }

    #[test]
    fn test_dangling_and_transitive() {
        let mut graph = BuildGraph::new("/ws");
        let base = target("lib", "base", "go_library", &[], &["//missing:thing", "@ext//x:y"]);
        let mid = target("lib", "mid", "go_library", &[], &[":base"]);
        let top = target("app", "top", "go_binary", &[], &["//lib:mid"]);
        graph.apply_file(contribution("/ws/lib/BUILD", "lib", "l", vec![base, mid]));
        graph.apply_file(contribution("/ws/app/BUILD", "app", "a", vec![top]));

        let dangling = graph.dangling_references();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].missing.to_string(), "//missing:thing");

        let base_label = Label::parse("//lib:base").unwrap();
        let all: Vec<String> = graph
            .transitive_reverse_dependencies(&base_label)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(all, vec!["//app:top", "//lib:mid"]);
    }

    #[test]
    fn test_code_lenses() {
        let mut graph = BuildGraph::new("/ws");
        let bin = target("a", "bin", "go_binary", &[], &[]);
        let test = target("a", "bin_test", "go_test", &[], &[]);
        graph.apply_file(contribution("/ws/a/BUILD", "a", "v", vec![bin, test]));

        let actions: Vec<(String, ActionKind)> = graph
            .code_lenses(Path::new("/ws/a/BUILD"))
            .into_iter()
            .map(|a| (a.label.name().to_string(), a.action))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("bin".to_string(), ActionKind::Build),
                ("bin".to_string(), ActionKind::Run),
                ("bin_test".to_string(), ActionKind::Build),
                ("bin_test".to_string(), ActionKind::Test),
            ]
        );
    }
}
