//! JSON-RPC 2.0 over stdio with `Content-Length` framing

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, trace, warn};
use trellis_core::LanguageEngineError;

type Reply = Result<Value, LanguageEngineError>;

/// Write one framed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Value) -> std::io::Result<()> {
    let content = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", content.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&content).await?;
    writer.flush().await
}

/// Read one framed message. `Ok(None)` at a clean end of stream.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Value>, LanguageEngineError> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| LanguageEngineError::Protocol(e.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|_| LanguageEngineError::Protocol(format!("invalid Content-Length: {value}")))?,
                );
            }
        }
    }

    let length = content_length.ok_or_else(|| LanguageEngineError::Protocol("missing Content-Length".into()))?;
    let mut content = vec![0u8; length];
    reader
        .read_exact(&mut content)
        .await
        .map_err(|e| LanguageEngineError::Protocol(e.to_string()))?;
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| LanguageEngineError::Protocol(e.to_string()))
}

/// A live connection to one engine process. Requests may be issued
/// concurrently; responses are matched by id.
pub struct RpcConnection {
    name: String,
    child: Mutex<Child>,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Arc<DashMap<i64, oneshot::Sender<Reply>>>,
    next_id: AtomicI64,
    alive: Arc<AtomicBool>,
}

impl RpcConnection {
    pub fn spawn(name: &str, program: &str, args: &[String], cwd: &Path) -> Result<Self, LanguageEngineError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LanguageEngineError::NotFound(program.to_string()),
                _ => LanguageEngineError::Spawn(format!("{program}: {e}")),
            })?;

        let missing = |pipe: &str| LanguageEngineError::Spawn(format!("{program}: no {pipe} pipe"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", name, line);
                }
            });
        }

        let connection = RpcConnection {
            name: name.to_string(),
            child: Mutex::new(child),
            stdin: Arc::new(Mutex::new(stdin)),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicI64::new(1),
            alive: Arc::new(AtomicBool::new(true)),
        };
        connection.spawn_reader(stdout);
        Ok(connection)
    }

    fn spawn_reader<R: AsyncRead + Unpin + Send + 'static>(&self, stdout: R) {
        let name = self.name.clone();
        let pending = Arc::clone(&self.pending);
        let alive = Arc::clone(&self.alive);
        let stdin = Arc::clone(&self.stdin);

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let reason = loop {
                match read_frame(&mut reader).await {
                    Ok(Some(message)) => dispatch(&name, &pending, &stdin, message),
                    Ok(None) => break LanguageEngineError::Crashed(name.clone()),
                    Err(err) => {
                        warn!("[{}] unreadable message: {}", name, err);
                        break err;
                    }
                }
            };
            alive.store(false, Ordering::SeqCst);
            let ids: Vec<i64> = pending.iter().map(|e| *e.key()).collect();
            for id in ids {
                if let Some((_, tx)) = pending.remove(&id) {
                    let _ = tx.send(Err(reason.clone()));
                }
            }
            debug!("[{}] reader stopped: {}", name, reason);
        });
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request and wait up to `timeout` for its response.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Reply {
        if !self.is_alive() {
            return Err(LanguageEngineError::Crashed(self.name.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(err) = self.write(&message).await {
            self.pending.remove(&id);
            return Err(err);
        }
        trace!("[{}] -> {} #{}", self.name, method, id);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(LanguageEngineError::Crashed(self.name.clone())),
            Err(_) => {
                self.pending.remove(&id);
                Err(LanguageEngineError::Timeout(method.to_string()))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), LanguageEngineError> {
        self.write(&json!({ "jsonrpc": "2.0", "method": method, "params": params })).await
    }

    async fn write(&self, message: &Value) -> Result<(), LanguageEngineError> {
        let mut stdin = self.stdin.lock().await;
        write_frame(&mut *stdin, message).await.map_err(|e| {
            self.alive.store(false, Ordering::SeqCst);
            LanguageEngineError::Crashed(format!("{}: {}", self.name, e))
        })
    }

    /// `shutdown`/`exit`, then kill whatever is left.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.is_alive() {
            let _ = self.request("shutdown", Value::Null, timeout).await;
            let _ = self.notify("exit", Value::Null).await;
        }
        let mut child = self.child.lock().await;
        if tokio::time::timeout(timeout, child.wait()).await.is_err() {
            let _ = child.start_kill();
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Route one incoming message: responses complete their pending request,
/// engine requests get a null result, notifications are dropped.
fn dispatch(
    name: &str,
    pending: &DashMap<i64, oneshot::Sender<Reply>>,
    stdin: &Arc<Mutex<ChildStdin>>,
    message: Value,
) {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(Value::as_str);

    match (id, method) {
        (Some(id), None) => {
            let Some(id) = id.as_i64() else {
                warn!("[{}] response with non-numeric id {}", name, id);
                return;
            };
            let Some((_, tx)) = pending.remove(&id) else {
                trace!("[{}] late response #{}", name, id);
                return;
            };
            let reply = match message.get("error") {
                Some(error) => Err(LanguageEngineError::Remote {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    message: error.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string(),
                }),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(reply);
        }
        (Some(id), Some(method)) => {
            trace!("[{}] <- request {}", name, method);
            let stdin = Arc::clone(stdin);
            tokio::spawn(async move {
                let answer = json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null });
                let mut stdin = stdin.lock().await;
                let _ = write_frame(&mut *stdin, &answer).await;
            });
        }
        (None, Some(method)) => trace!("[{}] <- notification {}", name, method),
        (None, None) => warn!("[{}] message without id or method", name),
    }
}
