//! HTTP + WebSocket front end over the build graph, the build tool and the
//! language engines

pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
pub mod websocket;


use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

pub use error::{ServerError, ServerResult};
pub use router::create_router;
pub use state::{Capabilities, InitializeResult, ServerState, Workspace};
pub use websocket::{ClientMessage, ServerMessage};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Watch the workspace for changes made outside the editor.
    pub watch: bool,
    /// Settings merged over every workspace's `.trellis.toml`.
    pub overrides: Value,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { host: "127.0.0.1".to_string(), port: 7878, watch: true, overrides: Value::Null }
    }
}

pub struct TrellisServer {
    state: Arc<ServerState>,
    config: ServerConfig,
}

impl TrellisServer {
    pub fn new(config: ServerConfig) -> Self {
        let state = Arc::new(ServerState::new(config.overrides.clone(), config.watch));
        TrellisServer { state, config }
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Serve until the process receives Ctrl-C, then stop the engines.
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.config.host, self.config.port))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("Trellis server listening on http://{}", addr);

        let app = create_router(self.state());
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("server error")?;

        self.state.shutdown().await;
        Ok(())
    }
}
