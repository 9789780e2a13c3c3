//! Route definitions

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::handlers::{
    cloud_verify, cloud_webhook, health, logout_session, pair_session, pause_campaign,
    resume_campaign, retry_campaign, session_events, session_status, start_campaign,
};
use crate::middleware::auth::auth_middleware;
use crate::server::AppState;

/// Create the API router. Session routes exist only with a session manager.
pub fn routes(state: &AppState) -> Router<AppState> {
    let mut api = Router::new()
        .route("/api/campaigns/{campaign_id}/start", post(start_campaign))
        .route("/api/campaigns/{campaign_id}/pause", post(pause_campaign))
        .route("/api/campaigns/{campaign_id}/resume", post(resume_campaign))
        .route("/api/campaigns/{campaign_id}/retry", post(retry_campaign));

    if state.sessions.is_some() {
        api = api
            .route("/api/sessions/events", get(session_events))
            .route("/api/sessions/{session_id}", delete(logout_session))
            .route("/api/sessions/{session_id}/pair", post(pair_session))
            .route("/api/sessions/{session_id}/status", get(session_status));
    }

    let api = api.route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth_middleware,
    ));

    Router::new()
        // Health check
        .route("/health", get(health))
        // Cloud API webhook (verification handshake + events)
        .route("/webhook/cloud", get(cloud_verify).post(cloud_webhook))
        .merge(api)
}
