//! HTTP API Server
//!
//! Starts and manages the axum-based HTTP server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use wapush_campaign::DispatchEngine;
use wapush_core::{Config, SharedStore};
use wapush_whatsapp::SessionManager;

use crate::error::{ApiError, Result};
use crate::routes::routes;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub engine: Arc<DispatchEngine>,
    /// Present only when a device transport is wired in
    pub sessions: Option<SessionManager>,
}

impl AppState {
    pub fn sessions(&self) -> Result<&SessionManager> {
        self.sessions.as_ref().ok_or(ApiError::SessionsDisabled)
    }
}

/// Build the application router
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes(&state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP API server, returning once `shutdown` resolves
pub async fn start_server<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.api.port));
    let app = app(state);

    info!("HTTP API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP API stopped");
    Ok(())
}
