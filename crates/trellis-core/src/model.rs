//! Core data structures for the build graph

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::label::Label;

// ── Positions ───────────────────────────────────────────────

/// Zero-based line/character position in a text document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Position { line, character }
    }
}

/// Half-open range between two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Range { start, end }
    }

    /// Inclusive on both ends, matching how editors report a cursor sitting
    /// right after the last character of a token.
    pub fn contains(&self, position: Position) -> bool {
        self.start <= position && position <= self.end
    }
}

/// A range inside a specific file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub path: PathBuf,
    pub range: Range,
}

// ── Diagnostics ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

/// What produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Unparsable text; the statement was skipped.
    Syntax,
    /// A rule call on the allow-list without a usable `name`.
    MissingName,
    /// A second declaration of an existing label.
    DuplicateTarget,
    /// A string in a dependency attribute that is not a valid label.
    MalformedLabel,
    /// A dependency that names no known target.
    DanglingReference,
    /// The file could not be read.
    Io,
}

/// A positional, file-scoped problem report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
    pub range: Range,
}

impl Diagnostic {
    pub fn error(kind: DiagnosticKind, message: impl Into<String>, range: Range) -> Self {
        Diagnostic { kind, severity: Severity::Error, message: message.into(), range }
    }

    pub fn warning(kind: DiagnosticKind, message: impl Into<String>, range: Range) -> Self {
        Diagnostic { kind, severity: Severity::Warning, message: message.into(), range }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}: {:?}: {}",
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.kind,
            self.message
        )
    }
}

// ── Syntax ──────────────────────────────────────────────────

/// A parsed expression. Call-shaped constructs other than `glob` and
/// `select` are kept as `Call` without interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Number(f64),
    Boolean(bool),
    None,
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    /// A string literal that satisfies the label grammar, kept as written.
    /// Relative forms are qualified later against the declaring package.
    TargetReference(String),
    Identifier(String),
    /// `glob(include, exclude = ...)`, recognized but never expanded.
    Glob { include: Vec<Value>, exclude: Vec<Value> },
    /// `select({...})`, recognized but never resolved.
    Select(Vec<(Value, Value)>),
    Call { name: String, arguments: Vec<Argument> },
    /// `a + b + ...`
    Concat(Vec<Value>),
    /// Anything recognized only as text (comprehensions, operators).
    Expression(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The literal text of a string or a label reference.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::String(s) | Value::TargetReference(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Every string-like entry reachable without evaluation, walking lists,
    /// both sides of `+` and every branch of a `select`. Glob patterns are
    /// not included.
    pub fn static_strings(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_static_strings(&mut out);
        out
    }

    fn collect_static_strings(&self, out: &mut Vec<String>) {
        match self {
            Value::String(_) | Value::TargetReference(_) => {
                if let Some(text) = self.as_text() {
                    out.push(text);
                }
            }
            Value::List(items) | Value::Concat(items) => {
                for item in items {
                    item.collect_static_strings(out);
                }
            }
            Value::Select(branches) => {
                for (_, branch) in branches {
                    branch.collect_static_strings(out);
                }
            }
            _ => {}
        }
    }

    /// `glob` calls reachable the same way as [`Value::static_strings`],
    /// as `(include, exclude)` pattern lists.
    pub fn globs(&self) -> Vec<(Vec<String>, Vec<String>)> {
        let mut out = Vec::new();
        self.collect_globs(&mut out);
        out
    }

    fn collect_globs(&self, out: &mut Vec<(Vec<String>, Vec<String>)>) {
        match self {
            Value::Glob { include, exclude } => {
                let patterns = |values: &[Value]| values.iter().flat_map(Value::static_strings).collect::<Vec<_>>();
                out.push((patterns(include), patterns(exclude)));
            }
            Value::List(items) | Value::Concat(items) => {
                for item in items {
                    item.collect_globs(out);
                }
            }
            Value::Select(branches) => {
                for (_, branch) in branches {
                    branch.collect_globs(out);
                }
            }
            _ => {}
        }
    }
}

/// A positional or keyword argument to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Value,
    pub range: Range,
}

/// One imported symbol of a `load` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedSymbol {
    /// Name bound in this file.
    pub local: String,
    /// Name exported by the loaded module.
    pub exported: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatementKind {
    Load { module: String, symbols: Vec<LoadedSymbol> },
    Assignment { name: String, value: Value },
    RuleInvocation { kind: String, arguments: Vec<Argument> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementKind,
    pub range: Range,
}

// ── Build graph entities ────────────────────────────────────

/// A declared build unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub label: Label,
    /// Rule class, e.g. `go_binary`.
    pub kind: String,
    pub package: String,
    pub attributes: BTreeMap<String, Value>,
    /// Source entries as written, in declaration order.
    pub sources: Vec<String>,
    /// Source entries resolved against the package directory.
    pub source_paths: Vec<PathBuf>,
    /// Unexpanded `glob` calls in source attributes.
    #[serde(default)]
    pub source_globs: Vec<SourceGlob>,
    /// Dependency labels in declaration order, package-qualified.
    pub dependencies: Vec<Label>,
    /// Location of the defining call.
    pub location: Location,
    /// Index of the defining call among the file's statements.
    pub declaration_index: usize,
    /// False for kinds outside the allow-list; such targets are retained
    /// but kept out of the file and dependency indices.
    pub indexed: bool,
}

/// Patterns of one `glob` call, relative to the declaring package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGlob {
    pub directory: PathBuf,
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Target {
    pub fn is_test(&self) -> bool {
        self.kind.ends_with("_test")
    }

    pub fn is_runnable(&self) -> bool {
        self.kind.ends_with("_binary") || self.is_test()
    }

    pub fn summary(&self) -> TargetSummary {
        TargetSummary {
            label: self.label.to_string(),
            kind: self.kind.clone(),
            package: self.package.clone(),
            sources: self.sources.clone(),
            deps: self.dependencies.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// The wire shape of a target for `getAllTargets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub label: String,
    pub kind: String,
    pub package: String,
    pub sources: Vec<String>,
    pub deps: Vec<String>,
}

/// A parsed configuration file as retained by the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub path: PathBuf,
    /// Path of the containing directory relative to the workspace root.
    pub package: String,
    pub text: String,
    pub content_hash: u64,
    pub parsed_at: DateTime<Utc>,
    /// Labels declared by this file, in declaration order.
    pub labels: Vec<Label>,
    pub statements: Vec<Statement>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ConfigFile {
    pub fn content_hash(text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        hasher.finish()
    }
}

/// Everything one configuration file contributes to the graph. Produced by
/// the indexer, applied to the graph as one unit.
#[derive(Debug, Clone)]
pub struct FileContribution {
    pub file: ConfigFile,
    pub targets: Vec<Target>,
}
