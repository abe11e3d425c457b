//! Axum router for the Trellis front end

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::ServerState;
use crate::websocket::ws_handler;

pub fn create_router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/initialize", post(handlers::initialize))
        .route("/refresh", post(handlers::refresh))
        .route("/targets", get(handlers::list_targets))
        .route("/targets/for-file", get(handlers::target_for_file))
        .route("/targets/dependencies", get(handlers::dependencies))
        .route("/targets/reverse-dependencies", get(handlers::reverse_dependencies))
        .route("/targets/location", get(handlers::target_location))
        .route("/targets/references", get(handlers::references))
        .route("/documents/open", post(handlers::did_open))
        .route("/documents/change", post(handlers::did_change))
        .route("/documents/save", post(handlers::did_save))
        .route("/documents/close", post(handlers::did_close))
        .route("/documents/diagnostics", get(handlers::diagnostics))
        .route("/documents/actions", get(handlers::actions))
        .route("/definition", post(handlers::definition))
        .route("/completion", post(handlers::completion))
        .route("/hover", post(handlers::hover))
        .route("/query", post(handlers::query))
        // One parameter name per segment: `:command` is an action or an id.
        .route("/commands/:command", post(handlers::start_command))
        .route("/commands/:command/cancel", post(handlers::cancel_command));

    Router::new()
        .route("/ws", get(ws_handler))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
