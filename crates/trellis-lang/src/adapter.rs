//! The per-language capability interface

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use trellis_core::{LanguageEngineError, Location, Position};

use crate::protocol::{CompletionItem, DocumentRef};
use crate::supervisor::{EngineStatus, EngineSupervisor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub start: bool,
    pub definition: bool,
    pub completion: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities { start: false, definition: false, completion: false };
    pub const ENGINE: Capabilities = Capabilities { start: true, definition: true, completion: true };
}

/// One supported language. Requests for a capability the adapter lacks
/// resolve to an empty result through the default bodies.
#[async_trait]
pub trait LanguageAdapter: Send + Sync {
    fn language_id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn start(&self) -> Result<(), LanguageEngineError> {
        Ok(())
    }

    async fn definition(&self, _doc: &DocumentRef, _position: Position) -> Result<Option<Location>, LanguageEngineError> {
        Ok(None)
    }

    async fn completion(&self, _doc: &DocumentRef, _position: Position) -> Result<Vec<CompletionItem>, LanguageEngineError> {
        Ok(Vec::new())
    }

    async fn shutdown(&self) {}

    async fn status(&self) -> EngineStatus {
        EngineStatus::Disabled
    }

    /// Workspace-relative candidate paths for an import on `line` that
    /// points into the monorepo's own namespace. The first existing file
    /// or directory wins.
    fn workspace_import(&self, _line: &str, _character: u32) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// How a language's import statements map into the workspace.
pub trait ImportRules: Send + Sync + 'static {
    fn workspace_import(&self, line: &str, character: u32) -> Vec<PathBuf>;
}

/// An adapter backed by an external engine. `engine` is `None` when the
/// language is disabled, which leaves only import rewriting.
pub struct EngineAdapter<R> {
    language_id: &'static str,
    engine: Option<EngineSupervisor>,
    rules: R,
}

impl<R: ImportRules> EngineAdapter<R> {
    pub fn new(language_id: &'static str, engine: Option<EngineSupervisor>, rules: R) -> Self {
        EngineAdapter { language_id, engine, rules }
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    fn engine(&self) -> Result<&EngineSupervisor, LanguageEngineError> {
        self.engine.as_ref().ok_or_else(|| LanguageEngineError::Disabled(self.language_id.to_string()))
    }
}

#[async_trait]
impl<R: ImportRules> LanguageAdapter for EngineAdapter<R> {
    fn language_id(&self) -> &str {
        self.language_id
    }

    fn capabilities(&self) -> Capabilities {
        if self.engine.is_some() { Capabilities::ENGINE } else { Capabilities::NONE }
    }

    async fn start(&self) -> Result<(), LanguageEngineError> {
        self.engine()?.start().await
    }

    async fn definition(&self, doc: &DocumentRef, position: Position) -> Result<Option<Location>, LanguageEngineError> {
        self.engine()?.definition(doc, position).await
    }

    async fn completion(&self, doc: &DocumentRef, position: Position) -> Result<Vec<CompletionItem>, LanguageEngineError> {
        self.engine()?.completion(doc, position).await
    }

    async fn shutdown(&self) {
        if let Some(engine) = &self.engine {
            engine.shutdown().await;
        }
    }

    async fn status(&self) -> EngineStatus {
        match &self.engine {
            Some(engine) => engine.status().await,
            None => EngineStatus::Disabled,
        }
    }

    fn workspace_import(&self, line: &str, character: u32) -> Vec<PathBuf> {
        self.rules.workspace_import(line, character)
    }
}
