//! Trellis Core: data model, build graph, query cache and settings

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod graph;
pub mod label;
pub mod model;
pub mod workspace;


#[cfg(test)]
pub mod test_utils;

pub use cache::{CacheEntry, CacheStats, QueryCache, expression_packages, normalize_query, package_contains};
pub use cancel::CancelToken;
pub use config::{BuildToolSettings, LanguageSettings, RuleSettings, ScannerSettings, ServerSettings, Settings};
pub use error::{BuildToolError, ConfigError, LabelError, LanguageEngineError};
pub use graph::{ActionKind, BuildGraph, DanglingReference, GraphChange, SharedGraph, TargetAction};
pub use label::Label;
pub use model::{
    Argument, ConfigFile, Diagnostic, DiagnosticKind, FileContribution, LoadedSymbol, Location, Position, Range,
    Severity, SourceGlob, Statement, StatementKind, Target, TargetSummary, Value,
};
pub use workspace::{WORKSPACE_MARKERS, find_workspace_root, is_build_file, package_for_build_file, package_of};
