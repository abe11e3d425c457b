//! Error taxonomy shared across crates
//!
//! Syntax problems and dangling references are not errors; they travel as
//! [`crate::model::Diagnostic`] values attached to the file they concern.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings in {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid settings override: {0}")]
    Override(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("empty label")]
    Empty,
    #[error("label contains whitespace: {0:?}")]
    Whitespace(String),
    #[error("invalid repository name: {0:?}")]
    InvalidRepository(String),
    #[error("invalid package name: {0:?}")]
    InvalidPackage(String),
    #[error("invalid target name: {0:?}")]
    InvalidName(String),
    #[error("relative label needs a package context: {0:?}")]
    Relative(String),
}

/// Failures invoking the external build tool. Payloads are strings so the
/// error can be cloned to every waiter of a shared query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildToolError {
    #[error("build tool executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("failed to spawn build tool: {0}")]
    Spawn(String),
    /// Non-zero exit from a query. `stderr` is the tool's text, unmodified.
    #[error("query `{expression}` failed with exit code {exit_code:?}:\n{stderr}")]
    QueryFailed {
        expression: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("failed to decode build tool output: {0}")]
    Decode(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("no workspace has been initialized")]
    WorkspaceNotSet,
    #[error("build tool i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BuildToolError {
    fn from(err: std::io::Error) -> Self {
        BuildToolError::Io(err.to_string())
    }
}

/// Failures of one language engine. These never escape the adapter that
/// owns the engine as anything but an empty result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LanguageEngineError {
    #[error("language `{0}` is disabled")]
    Disabled(String),
    #[error("language engine not found: {0}")]
    NotFound(String),
    #[error("failed to spawn language engine: {0}")]
    Spawn(String),
    #[error("language engine `{0}` exited")]
    Crashed(String),
    #[error("language engine request `{0}` timed out")]
    Timeout(String),
    #[error("language engine protocol error: {0}")]
    Protocol(String),
    #[error("language engine restarting, retry in {retry_in:?}")]
    BackingOff { retry_in: Duration },
    #[error("language engine returned error {code}: {message}")]
    Remote { code: i64, message: String },
}
