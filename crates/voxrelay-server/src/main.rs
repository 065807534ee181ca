//! voxrelay server binary.
//!
//! Starts the axum relay server with structured logging and graceful
//! shutdown on SIGTERM/SIGINT. Live sessions are cancelled on shutdown so
//! every client and engine connection is closed before the process exits.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use voxrelay_engine::{EngineConnector, EngineProvider, GeminiConnector};
use voxrelay_server::{app, config, registry::SessionRegistry, AppState};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("VOXRELAY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn connector_for(provider: EngineProvider) -> Arc<dyn EngineConnector> {
    match provider {
        EngineProvider::Gemini => Arc::new(GeminiConnector),
    }
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    if config.engine.api_key.is_empty() {
        tracing::warn!("engine.api_key is empty; sessions will fail to connect until GEMINI_API_KEY is set");
    }

    let connector = connector_for(config.engine.provider);
    tracing::info!(
        engine = connector.name(),
        model = %config.engine.model,
        voice = %config.engine.voice,
        "engine configured"
    );

    let state = AppState::new(&config, connector);
    let sessions = state.sessions.clone();
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting voxrelay server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown(sessions))
    .await
    .expect("server error");

    tracing::info!("voxrelay server shut down");
}

/// Resolves on the shutdown signal after cancelling every live session.
async fn shutdown(sessions: SessionRegistry) {
    shutdown_signal().await;
    if sessions.is_empty().await {
        tracing::info!("no live sessions to cancel");
        return;
    }
    let cancelled = sessions.shutdown_all().await;
    tracing::info!(sessions = cancelled, "cancelled live sessions");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
