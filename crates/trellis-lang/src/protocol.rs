//! Request/response types and conversions from engine messages

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_core::{LanguageEngineError, Location, Position, Range};
use url::Url;

/// A document as the coordinator sees it: the editor's text and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub path: PathBuf,
    pub text: String,
    #[serde(default)]
    pub version: i32,
}

impl DocumentRef {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>, version: i32) -> Self {
        DocumentRef { path: path.into(), text: text.into(), version }
    }

    pub fn line(&self, line: u32) -> Option<&str> {
        self.text.lines().nth(line as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Rule,
    Label,
    Function,
    Variable,
    Module,
    Keyword,
    Text,
}

impl CompletionKind {
    /// Map an LSP `CompletionItemKind` number.
    fn from_lsp(kind: Option<u64>) -> Self {
        match kind {
            Some(2 | 3 | 4) => CompletionKind::Function,
            Some(5 | 6 | 10 | 21) => CompletionKind::Variable,
            Some(9) => CompletionKind::Module,
            Some(14) => CompletionKind::Keyword,
            _ => CompletionKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionItem {
    pub label: String,
    pub kind: CompletionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_text: Option<String>,
}

impl CompletionItem {
    pub fn new(label: impl Into<String>, kind: CompletionKind) -> Self {
        CompletionItem { label: label.into(), kind, detail: None, insert_text: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Markdown hover text for a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hover {
    pub contents: String,
    pub range: Option<Range>,
}

pub fn path_to_uri(path: &Path) -> Result<String, LanguageEngineError> {
    Url::from_file_path(path)
        .map(|u| u.to_string())
        .map_err(|_| LanguageEngineError::Protocol(format!("not an absolute path: {}", path.display())))
}

pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok()?.to_file_path().ok()
}

pub fn position_to_lsp(position: Position) -> Value {
    serde_json::json!({ "line": position.line, "character": position.character })
}

fn position_from_lsp(value: &Value) -> Option<Position> {
    Some(Position::new(value.get("line")?.as_u64()? as u32, value.get("character")?.as_u64()? as u32))
}

fn range_from_lsp(value: &Value) -> Option<Range> {
    Some(Range::new(position_from_lsp(value.get("start")?)?, position_from_lsp(value.get("end")?)?))
}

/// First location of a definition result: `Location`, `Location[]` or
/// `LocationLink[]`.
pub fn definition_from_lsp(result: &Value) -> Option<Location> {
    let first = match result {
        Value::Array(items) => items.first()?,
        Value::Null => return None,
        single => single,
    };
    let (uri, range) = match first.get("targetUri") {
        Some(uri) => (uri, first.get("targetSelectionRange").or_else(|| first.get("targetRange"))?),
        None => (first.get("uri")?, first.get("range")?),
    };
    Some(Location { path: uri_to_path(uri.as_str()?)?, range: range_from_lsp(range)? })
}

/// Items of a completion result: `CompletionItem[]` or `CompletionList`.
pub fn completions_from_lsp(result: &Value) -> Vec<CompletionItem> {
    let items = match result {
        Value::Array(items) => items,
        Value::Object(list) => match list.get("items").and_then(Value::as_array) {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            let label = item.get("label")?.as_str()?.to_string();
            Some(CompletionItem {
                label,
                kind: CompletionKind::from_lsp(item.get("kind").and_then(Value::as_u64)),
                detail: item.get("detail").and_then(Value::as_str).map(str::to_string),
                insert_text: item.get("insertText").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect()
}
