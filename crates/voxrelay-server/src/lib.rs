//! Voice relay server library logic.
//!
//! Browser clients connect to `/ws`; each connection gets its own engine
//! session and a [`session::SessionRelay`] that moves audio and text
//! between the two under the turn-taking rules in [`turn`].

pub mod codec;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod turn;

use axum::{routing::get, Extension, Json, Router};
use config::Config;
use registry::SessionRegistry;
use serde_json::{json, Value};
use session::RelaySettings;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use voxrelay_engine::{EngineConfig, EngineConnector};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Settings handed to the engine connector for every session.
    pub engine: Arc<EngineConfig>,
    /// Opens engine sessions.
    pub connector: Arc<dyn EngineConnector>,
    /// Settings every session relay runs with.
    pub relay: RelaySettings,
    /// Live sessions, for diagnostics and shutdown.
    pub sessions: SessionRegistry,
    /// Bound on any single write to a client socket.
    pub send_timeout: Duration,
}

impl AppState {
    pub fn new(config: &Config, connector: Arc<dyn EngineConnector>) -> Self {
        Self {
            engine: Arc::new(config.engine.clone()),
            connector,
            relay: config.relay_settings(),
            sessions: SessionRegistry::new(),
            send_timeout: config.heartbeat.send_timeout(),
        }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// `GET /api/sessions`: live sessions, oldest first.
async fn list_sessions_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let sessions = state.sessions.snapshots().await;
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/ws", get(supervisor::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
