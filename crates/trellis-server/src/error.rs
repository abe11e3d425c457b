//! Handler errors and their HTTP mapping

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use trellis_core::{BuildToolError, ConfigError, LabelError};
use trellis_indexer::ScanError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no workspace has been initialized")]
    WorkspaceNotSet,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    BuildTool(#[from] BuildToolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::WorkspaceNotSet => "workspace_not_set",
            ServerError::BadRequest(_) | ServerError::Label(_) => "bad_request",
            ServerError::NotFound(_) => "not_found",
            ServerError::BuildTool(BuildToolError::QueryFailed { .. }) => "query_failed",
            ServerError::BuildTool(BuildToolError::ExecutableNotFound(_)) => "executable_not_found",
            ServerError::BuildTool(_) => "build_tool_error",
            ServerError::Config(_) => "config_error",
            ServerError::Scan(_) => "scan_error",
            ServerError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::WorkspaceNotSet => StatusCode::PRECONDITION_FAILED,
            ServerError::BadRequest(_) | ServerError::Label(_) | ServerError::Config(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BuildTool(BuildToolError::QueryFailed { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::Scan(ScanError::MissingRoot(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::Internal(format!("{err:#}"))
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        // The tool's own message is passed through as-is.
        let message = match &self {
            ServerError::BuildTool(BuildToolError::QueryFailed { stderr, .. }) => stderr.clone(),
            other => other.to_string(),
        };
        let body = json!({ "error": self.code(), "message": message });
        (self.status(), Json(body)).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
