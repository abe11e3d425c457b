//! WebSocket channel for server-pushed notifications

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use trellis_buildtool::{BuildEvent, InvocationReport};

use crate::state::ServerState;

/// Messages pushed to clients, tagged by `type`. Graph and scan
/// notifications from the watcher share the channel with their own tags.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready { initialized: bool, root: Option<PathBuf> },
    InvocationEvent { invocation_id: u64, event: BuildEvent },
    InvocationFinished { invocation_id: u64, report: InvocationReport },
    InvocationFailed { invocation_id: u64, error: String },
    Pong,
    Error { message: String },
}

/// What a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Pong,
    Cancel { invocation_id: u64 },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    info!("WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut notifications = state.notify_tx.subscribe();
    let (reply_tx, mut replies) = mpsc::channel::<ServerMessage>(16);

    let root = state.current_root().await;
    let ready = ServerMessage::Ready { initialized: root.is_some(), root };
    if let Some(json) = encode(&ready) {
        if sender.send(Message::Text(json)).await.is_err() {
            warn!("Failed to greet WebSocket client");
            return;
        }
    }

    let recv_state = Arc::clone(&state);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => handle_client_message(message, &recv_state),
                        Err(e) => {
                            warn!("Failed to parse WebSocket message: {}", e);
                            Some(ServerMessage::Error { message: format!("unrecognized message: {e}") })
                        }
                    };
                    if let Some(reply) = reply {
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => {
                    debug!("WebSocket client disconnected");
                    break;
                }
                _ => {}
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                received = notifications.recv() => match received {
                    Ok(json) => json,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagged behind by {} messages", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = replies.recv() => match reply {
                    Some(message) => match encode(&message) {
                        Some(json) => json,
                        None => continue,
                    },
                    None => break,
                },
            };
            if sender.send(Message::Text(outgoing)).await.is_err() {
                debug!("Failed to send message to WebSocket client");
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!("WebSocket connection closed");
}

fn handle_client_message(message: ClientMessage, state: &ServerState) -> Option<ServerMessage> {
    match message {
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::Pong => None,
        ClientMessage::Cancel { invocation_id } => {
            if state.cancel_invocation(invocation_id) {
                None
            } else {
                Some(ServerMessage::Error { message: format!("no running invocation {invocation_id}") })
            }
        }
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    serde_json::to_string(message)
        .map_err(|e| warn!("Failed to serialize server message: {}", e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_message_tags() {
        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json["type"], "pong");

        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"cancel","invocation_id":4}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Cancel { invocation_id: 4 }));
    }

    #[test]
    fn test_ping_and_unknown_cancel() {
        let state = ServerState::new(Value::Null, false);
        assert!(matches!(handle_client_message(ClientMessage::Ping, &state), Some(ServerMessage::Pong)));
        assert!(handle_client_message(ClientMessage::Pong, &state).is_none());
        assert!(matches!(
            handle_client_message(ClientMessage::Cancel { invocation_id: 9 }, &state),
            Some(ServerMessage::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast() {
        let state = ServerState::new(Value::Null, false);
        let mut rx = state.notify_tx.subscribe();
        assert!(state.broadcast("hello".to_string()).is_ok());
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
