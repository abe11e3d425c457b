//! Lifecycle of one language engine: lazy start, document sync, restart
//! with backoff

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use trellis_core::{ConfigFile, LanguageEngineError, LanguageSettings, Location, Position};

use crate::protocol::{CompletionItem, DocumentRef, completions_from_lsp, definition_from_lsp, path_to_uri, position_to_lsp};
use crate::rpc::RpcConnection;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Delay before the next start attempt after `failures` consecutive failures.
pub fn backoff_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineCommand {
    /// `settings.engine_path`/`args` when set, otherwise the given default.
    pub fn resolve(settings: &LanguageSettings, program: &str, args: &[&str]) -> Self {
        EngineCommand {
            program: settings.engine_path.clone().unwrap_or_else(|| program.to_string()),
            args: if settings.engine_path.is_some() || !settings.args.is_empty() {
                settings.args.clone()
            } else {
                args.iter().map(|a| a.to_string()).collect()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineStatus {
    Disabled,
    NotStarted,
    /// Spawned, waiting for the `initialize` handshake.
    Starting,
    Running,
    BackingOff { failures: u32, retry_in_ms: u64 },
}

#[derive(Default)]
struct EngineState {
    connection: Option<Arc<RpcConnection>>,
    starting: bool,
    failures: u32,
    retry_at: Option<Instant>,
    /// Version sent to the engine and hash of the text it holds.
    synced: HashMap<PathBuf, (i32, u64)>,
}

impl EngineState {
    fn mark_failed(&mut self, language_id: &str) {
        self.connection = None;
        self.synced.clear();
        self.failures += 1;
        let delay = backoff_delay(self.failures);
        self.retry_at = Some(Instant::now() + delay);
        warn!("{} engine failed ({} in a row); next start in {:?}", language_id, self.failures, delay);
    }
}

pub struct EngineSupervisor {
    language_id: String,
    command: EngineCommand,
    root: PathBuf,
    timeout: Duration,
    initialization_options: Value,
    state: Mutex<EngineState>,
    /// Held for a whole spawn and handshake; `state` is only held briefly.
    start_lock: Mutex<()>,
}

impl EngineSupervisor {
    pub fn new(language_id: &str, command: EngineCommand, root: &Path, settings: &LanguageSettings) -> Self {
        EngineSupervisor {
            language_id: language_id.to_string(),
            command,
            root: root.to_path_buf(),
            timeout: settings.request_timeout(),
            initialization_options: Value::Null,
            state: Mutex::new(EngineState::default()),
            start_lock: Mutex::new(()),
        }
    }

    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = options;
        self
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn command(&self) -> &EngineCommand {
        &self.command
    }

    pub async fn status(&self) -> EngineStatus {
        let state = self.state.lock().await;
        match (&state.connection, state.retry_at) {
            (Some(conn), _) if conn.is_alive() => EngineStatus::Running,
            _ if state.starting => EngineStatus::Starting,
            (_, Some(at)) if at > Instant::now() => EngineStatus::BackingOff {
                failures: state.failures,
                retry_in_ms: at.saturating_duration_since(Instant::now()).as_millis() as u64,
            },
            _ => EngineStatus::NotStarted,
        }
    }

    /// Start the engine if it is not running.
    pub async fn start(&self) -> Result<(), LanguageEngineError> {
        self.connection().await.map(|_| ())
    }

    /// The live connection, spawning and initializing the engine if needed.
    /// Concurrent callers queue on the start lock; only one spawns.
    async fn connection(&self) -> Result<Arc<RpcConnection>, LanguageEngineError> {
        if let Some(conn) = self.live_connection().await? {
            return Ok(conn);
        }
        let _starting = self.start_lock.lock().await;
        if let Some(conn) = self.live_connection().await? {
            return Ok(conn);
        }
        self.state.lock().await.starting = true;

        info!("Starting {} engine: {} {}", self.language_id, self.command.program, self.command.args.join(" "));
        let started = match RpcConnection::spawn(&self.language_id, &self.command.program, &self.command.args, &self.root) {
            Ok(conn) => self.initialize(conn).await,
            Err(err) => Err(err),
        };

        let mut state = self.state.lock().await;
        state.starting = false;
        match started {
            Ok(conn) => {
                let conn = Arc::new(conn);
                state.connection = Some(Arc::clone(&conn));
                state.retry_at = None;
                Ok(conn)
            }
            Err(err) => {
                state.mark_failed(&self.language_id);
                Err(err)
            }
        }
    }

    /// The running connection, if any. A dead one is recorded as a failure;
    /// an active backoff window is an error.
    async fn live_connection(&self) -> Result<Option<Arc<RpcConnection>>, LanguageEngineError> {
        let mut state = self.state.lock().await;
        match &state.connection {
            Some(conn) if conn.is_alive() => return Ok(Some(Arc::clone(conn))),
            Some(_) => state.mark_failed(&self.language_id),
            None => {}
        }
        match state.retry_at {
            Some(at) if at > Instant::now() => Err(LanguageEngineError::BackingOff { retry_in: at - Instant::now() }),
            _ => Ok(None),
        }
    }

    async fn initialize(&self, conn: RpcConnection) -> Result<RpcConnection, LanguageEngineError> {
        let root_uri = path_to_uri(&self.root)?;
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "rootPath": self.root.display().to_string(),
            "capabilities": {
                "textDocument": {
                    "definition": { "linkSupport": true },
                    "completion": { "completionItem": { "snippetSupport": false } },
                    "synchronization": { "didSave": false }
                }
            },
            "initializationOptions": self.initialization_options,
            "workspaceFolders": [{ "uri": root_uri, "name": "workspace" }]
        });
        conn.request("initialize", params, self.timeout).await?;
        conn.notify("initialized", json!({})).await?;
        debug!("{} engine initialized", self.language_id);
        Ok(conn)
    }

    /// One request against the running engine. A dead or unintelligible
    /// engine is dropped and restarted later; a timeout leaves it running.
    async fn request(&self, conn: &Arc<RpcConnection>, method: &str, params: Value) -> Result<Value, LanguageEngineError> {
        let result = conn.request(method, params, self.timeout).await;
        let mut state = self.state.lock().await;
        let current = state.connection.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn));
        match &result {
            Ok(_) => state.failures = 0,
            Err(LanguageEngineError::Crashed(_) | LanguageEngineError::Protocol(_)) if current => {
                state.mark_failed(&self.language_id)
            }
            Err(_) => {}
        }
        result
    }

    /// Bring the engine's copy of `doc` up to date.
    async fn sync_document(&self, conn: &RpcConnection, doc: &DocumentRef) -> Result<(), LanguageEngineError> {
        let hash = ConfigFile::content_hash(&doc.text);
        let (version, opened) = {
            let mut state = self.state.lock().await;
            let previous = state.synced.get(&doc.path).copied();
            if previous.is_some_and(|(_, h)| h == hash) {
                return Ok(());
            }
            let version = match previous {
                Some((sent, _)) => doc.version.max(sent + 1),
                None => doc.version.max(1),
            };
            state.synced.insert(doc.path.clone(), (version, hash));
            (version, previous.is_some())
        };

        let uri = path_to_uri(&doc.path)?;
        if opened {
            conn.notify(
                "textDocument/didChange",
                json!({
                    "textDocument": { "uri": uri, "version": version },
                    "contentChanges": [{ "text": doc.text }]
                }),
            )
            .await
        } else {
            conn.notify(
                "textDocument/didOpen",
                json!({
                    "textDocument": {
                        "uri": uri,
                        "languageId": self.language_id,
                        "version": version,
                        "text": doc.text
                    }
                }),
            )
            .await
        }
    }

    pub async fn definition(&self, doc: &DocumentRef, position: Position) -> Result<Option<Location>, LanguageEngineError> {
        let conn = self.connection().await?;
        self.sync_document(&conn, doc).await?;
        let params = json!({
            "textDocument": { "uri": path_to_uri(&doc.path)? },
            "position": position_to_lsp(position)
        });
        let result = self.request(&conn, "textDocument/definition", params).await?;
        Ok(definition_from_lsp(&result))
    }

    pub async fn completion(&self, doc: &DocumentRef, position: Position) -> Result<Vec<CompletionItem>, LanguageEngineError> {
        let conn = self.connection().await?;
        self.sync_document(&conn, doc).await?;
        let params = json!({
            "textDocument": { "uri": path_to_uri(&doc.path)? },
            "position": position_to_lsp(position)
        });
        let result = self.request(&conn, "textDocument/completion", params).await?;
        Ok(completions_from_lsp(&result))
    }

    pub async fn shutdown(&self) {
        let connection = {
            let mut state = self.state.lock().await;
            state.synced.clear();
            state.connection.take()
        };
        if let Some(conn) = connection {
            info!("Stopping {} engine", self.language_id);
            conn.shutdown(self.timeout.min(Duration::from_secs(2))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(4), Duration::from_secs(4));
        assert_eq!(backoff_delay(7), Duration::from_secs(30));
        assert_eq!(backoff_delay(64), Duration::from_secs(30));
    }

    #[test]
    fn test_engine_command_overrides() {
        let defaults = LanguageSettings::default();
        let command = EngineCommand::resolve(&defaults, "gopls", &["-mode=stdio"]);
        assert_eq!(command, EngineCommand { program: "gopls".into(), args: vec!["-mode=stdio".into()] });

        let custom = LanguageSettings { engine_path: Some("/opt/gopls".into()), ..Default::default() };
        let command = EngineCommand::resolve(&custom, "gopls", &["-mode=stdio"]);
        assert_eq!(command.program, "/opt/gopls");
        assert!(command.args.is_empty());
    }

    #[tokio::test]
    async fn test_missing_engine_backs_off() {
        let settings = LanguageSettings::default();
        let command = EngineCommand { program: "/nonexistent/engine".into(), args: vec![] };
        let supervisor = EngineSupervisor::new("go", command, Path::new("/"), &settings);

        assert!(matches!(supervisor.start().await, Err(LanguageEngineError::NotFound(_))));
        assert!(matches!(supervisor.start().await, Err(LanguageEngineError::BackingOff { .. })));
        assert!(matches!(supervisor.status().await, EngineStatus::BackingOff { failures: 1, .. }));
    }
}
