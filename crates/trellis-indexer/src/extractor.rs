//! Promotes parsed rule calls to targets

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use trellis_core::{
    Argument, ConfigFile, Diagnostic, DiagnosticKind, FileContribution, Label, Location, RuleSettings, SourceGlob,
    Statement, StatementKind, Target, Value, package_for_build_file,
};

use crate::parser::{self, ParsedFile};

/// Identifier substitution depth; guards against `A = B`, `B = A` loops.
const MAX_SUBSTITUTION_DEPTH: usize = 8;

/// Turns one build file into its graph contribution.
pub struct TargetExtractor<'a> {
    root: &'a Path,
    rules: &'a RuleSettings,
}

impl<'a> TargetExtractor<'a> {
    pub fn new(root: &'a Path, rules: &'a RuleSettings) -> Self {
        TargetExtractor { root, rules }
    }

    /// Parse `text` as the build file at `path` and extract its targets.
    pub fn extract(&self, path: &Path, text: &str) -> FileContribution {
        let parsed = parser::parse(text);
        self.promote(path, text, parsed)
    }

    /// A placeholder contribution for a file that could not be read.
    pub fn unreadable(&self, path: &Path, error: &std::io::Error) -> FileContribution {
        let diagnostic = Diagnostic::error(
            DiagnosticKind::Io,
            format!("failed to read {}: {}", path.display(), error),
            Default::default(),
        );
        FileContribution {
            file: ConfigFile {
                path: path.to_path_buf(),
                package: self.package(path),
                text: String::new(),
                content_hash: 0,
                parsed_at: Utc::now(),
                labels: Vec::new(),
                statements: Vec::new(),
                diagnostics: vec![diagnostic],
            },
            targets: Vec::new(),
        }
    }

    fn package(&self, path: &Path) -> String {
        package_for_build_file(self.root, path).unwrap_or_default()
    }

    fn promote(&self, path: &Path, text: &str, parsed: ParsedFile) -> FileContribution {
        let ParsedFile { statements, mut diagnostics } = parsed;
        let package = self.package(path);
        let package_dir = self.root.join(&package);
        let bindings = top_level_bindings(&statements);

        let mut targets = Vec::new();
        let mut seen: HashSet<Label> = HashSet::new();

        for (declaration_index, statement) in statements.iter().enumerate() {
            let StatementKind::RuleInvocation { kind: callee, arguments } = &statement.kind else {
                continue;
            };
            let kind = callee.strip_prefix("native.").unwrap_or(callee);
            let indexed = self.rules.is_known_kind(kind);

            let name = keyword(arguments, "name")
                .map(|v| bindings.resolve(v))
                .and_then(|v| v.as_text());
            let Some(name) = name else {
                if indexed {
                    diagnostics.push(Diagnostic::error(
                        DiagnosticKind::MissingName,
                        format!("{kind} call has no string `name` argument"),
                        statement.range,
                    ));
                }
                continue;
            };

            let label = match Label::new(package.clone(), name.clone()) {
                Ok(label) => label,
                Err(err) => {
                    diagnostics.push(Diagnostic::error(
                        DiagnosticKind::MalformedLabel,
                        format!("invalid target name {name:?}: {err}"),
                        statement.range,
                    ));
                    continue;
                }
            };
            if !seen.insert(label.clone()) {
                diagnostics.push(Diagnostic::warning(
                    DiagnosticKind::DuplicateTarget,
                    format!("target {label} is declared more than once; keeping the first"),
                    statement.range,
                ));
                continue;
            }

            let mut target = Target {
                label,
                kind: kind.to_string(),
                package: package.clone(),
                attributes: BTreeMap::new(),
                sources: Vec::new(),
                source_paths: Vec::new(),
                source_globs: Vec::new(),
                dependencies: Vec::new(),
                location: Location { path: path.to_path_buf(), range: statement.range },
                declaration_index,
                indexed,
            };

            for argument in arguments {
                let Some(attr) = argument.name.as_deref() else { continue };
                let value = bindings.resolve(&argument.value);
                if self.rules.is_source_attribute(attr) {
                    self.collect_sources(&mut target, &package_dir, &value);
                }
                if self.rules.is_dependency_attribute(attr) {
                    for entry in value.static_strings() {
                        match Label::parse_relative(&entry, &package) {
                            Ok(dep) => push_unique(&mut target.dependencies, dep),
                            Err(err) => diagnostics.push(Diagnostic::warning(
                                DiagnosticKind::MalformedLabel,
                                format!("`{attr}` entry {entry:?} is not a valid label: {err}"),
                                argument.range,
                            )),
                        }
                    }
                }
                target.attributes.insert(attr.to_string(), value);
            }

            targets.push(target);
        }

        FileContribution {
            file: ConfigFile {
                path: path.to_path_buf(),
                package,
                text: text.to_string(),
                content_hash: ConfigFile::content_hash(text),
                parsed_at: Utc::now(),
                labels: Vec::new(),
                statements,
                diagnostics,
            },
            targets,
        }
    }

    /// Plain entries are files relative to the package. Label entries name
    /// a file when their name has an extension; otherwise they reference
    /// another target and are kept as dependency edges. Globs are kept as
    /// patterns for the graph to match against.
    fn collect_sources(&self, target: &mut Target, package_dir: &Path, value: &Value) {
        for (include, exclude) in value.globs() {
            if !include.is_empty() {
                target.source_globs.push(SourceGlob { directory: package_dir.to_path_buf(), include, exclude });
            }
        }
        for entry in value.static_strings() {
            if Label::is_label_shaped(&entry) {
                let Ok(label) = Label::parse_relative(&entry, &target.package) else {
                    continue;
                };
                target.sources.push(entry);
                if label.is_main_repo() && looks_like_file(label.name()) {
                    let path = self.root.join(label.package()).join(label.name());
                    push_unique(&mut target.source_paths, normalize(&path));
                } else {
                    push_unique(&mut target.dependencies, label);
                }
            } else {
                let path = normalize(&package_dir.join(&entry));
                target.sources.push(entry);
                push_unique(&mut target.source_paths, path);
            }
        }
    }
}

fn keyword<'v>(arguments: &'v [Argument], name: &str) -> Option<&'v Value> {
    arguments.iter().find(|a| a.name.as_deref() == Some(name)).map(|a| &a.value)
}

fn looks_like_file(name: &str) -> bool {
    name.rsplit('/').next().is_some_and(|base| base.contains('.'))
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// Lexically drop `.` components and fold `..`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Top-level `NAME = value` bindings, with `NAME += x` folded in order.
struct Bindings {
    values: HashMap<String, Value>,
}

fn top_level_bindings(statements: &[Statement]) -> Bindings {
    let mut values: HashMap<String, Value> = HashMap::new();
    for statement in statements {
        let StatementKind::Assignment { name, value } = &statement.kind else {
            continue;
        };
        let folded = match value {
            Value::Concat(parts) if parts.first() == Some(&Value::Identifier(name.clone())) => {
                let mut merged = Vec::with_capacity(parts.len());
                merged.push(values.get(name).cloned().unwrap_or(Value::List(Vec::new())));
                merged.extend(parts.iter().skip(1).cloned());
                Value::Concat(merged)
            }
            other => other.clone(),
        };
        values.insert(name.clone(), folded);
    }
    Bindings { values }
}

impl Bindings {
    /// Substitute identifiers bound at top level, structurally.
    fn resolve(&self, value: &Value) -> Value {
        self.resolve_depth(value, 0)
    }

    fn resolve_depth(&self, value: &Value, depth: usize) -> Value {
        if depth >= MAX_SUBSTITUTION_DEPTH {
            return value.clone();
        }
        match value {
            Value::Identifier(name) => match self.values.get(name) {
                Some(bound) => self.resolve_depth(bound, depth + 1),
                None => value.clone(),
            },
            Value::Concat(parts) => Value::Concat(parts.iter().map(|p| self.resolve_depth(p, depth + 1)).collect()),
            Value::List(items) => Value::List(items.iter().map(|i| self.resolve_depth(i, depth + 1)).collect()),
            other => other.clone(),
        }
    }
}
