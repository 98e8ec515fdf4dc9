use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use super::api::{self, AppState, SharedState};
use super::pipeline::PipelineEngine;
use super::store::open_store;
use crate::config::StudioConfig;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            dev_mode: false,
        }
    }
}

impl From<&StudioConfig> for ServerConfig {
    fn from(config: &StudioConfig) -> Self {
        let server = &config.toml.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            dev_mode: server.dev,
        }
    }
}

/// Build the full application router. Dev mode allows cross-origin requests
/// from a separately served UI.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Open the store, reconcile interrupted runs, and serve until a shutdown
/// signal arrives.
pub async fn start_server(config: &StudioConfig) -> Result<()> {
    let server = ServerConfig::from(config);
    let store = open_store(&config.toml.storage).context("Failed to open run store")?;
    let engine = PipelineEngine::from_config(&config.toml, store);

    let recovery = engine
        .recover()
        .await
        .context("Failed to recover runs from the store")?;
    if !recovery.interrupted.is_empty() || !recovery.restarted.is_empty() {
        info!(
            interrupted = recovery.interrupted.len(),
            restarted = recovery.restarted.len(),
            "recovered runs from previous session"
        );
    }

    let state = Arc::new(AppState::new(engine.clone()));
    let app = build_router(Arc::clone(&state), server.dev_mode);

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, dev = server.dev_mode, "server listening");
    println!("Brand studio running at http://{}", local_addr);

    let shutdown = async move {
        shutdown_signal().await;
        info!("shutting down");
        state.shutdown.cancel();
        engine.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
