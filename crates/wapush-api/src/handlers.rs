//! HTTP API handlers
//!
//! Request handlers for session management, campaign control and the
//! Cloud API webhook.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    Json,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use wapush_campaign::DispatchEngine;
use wapush_core::store::lock;
use wapush_core::{detect_opt_out, BlacklistEntry, Campaign, RecipientStatus};
use wapush_whatsapp::cloud::CloudMessage;
use wapush_whatsapp::{CloudWebhookPayload, SessionStatus};

use crate::error::{ApiError, Result};
use crate::server::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

/// Query of `POST /api/sessions/{id}/pair`
#[derive(Debug, Deserialize)]
pub struct PairQuery {
    /// Drop stored credentials before pairing
    #[serde(default = "default_force_new")]
    pub force_new: bool,
}

fn default_force_new() -> bool {
    true
}

/// Retry response payload
#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub campaign_id: String,
    pub requeued: usize,
}

/// Cloud API subscription handshake
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// What a webhook delivery changed
#[derive(Debug, Default, Serialize)]
pub struct WebhookSummary {
    pub statuses_applied: usize,
    pub opt_outs: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidRequest(format!(
            "invalid session id: {}",
            session_id
        )))
    }
}

/// Start (or restart) pairing for a session
pub async fn pair_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PairQuery>,
) -> Result<(StatusCode, Json<SessionStatus>)> {
    validate_session_id(&session_id)?;
    let sessions = state.sessions()?;
    info!(session_id = %session_id, force_new = query.force_new, "Pair requested");

    sessions.start_pairing(&session_id, query.force_new).await?;
    Ok((StatusCode::ACCEPTED, Json(sessions.status(&session_id))))
}

/// Log a session out and delete its credentials
pub async fn logout_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    validate_session_id(&session_id)?;
    state.sessions()?.logout(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>> {
    validate_session_id(&session_id)?;
    Ok(Json(state.sessions()?.status(&session_id)))
}

/// Stream every session status update over a WebSocket
pub async fn session_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response> {
    let sessions = state.sessions()?.clone();
    Ok(ws.on_upgrade(move |socket| stream_status(socket, sessions)))
}

async fn stream_status(socket: WebSocket, sessions: wapush_whatsapp::SessionManager) {
    let mut updates = sessions.subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!("Status stream opened");

    let send_task = async move {
        loop {
            let update = match updates.recv().await {
                Ok(update) => update,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Status stream lagged, skipped {} updates", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&update) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode status update: {}", e);
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    };

    // クライアントからのメッセージは読み捨て、切断のみ検知する
    let recv_task = async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(WsMessage::Close(_)) => break,
                Err(e) => {
                    debug!("Status stream error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
    info!("Status stream closed");
}

/// Run a dispatch pass in the background
fn spawn_pass(engine: Arc<DispatchEngine>, campaign_id: String) {
    tokio::spawn(async move {
        match engine.run_pass(&campaign_id).await {
            Ok(report) => debug!(
                campaign_id = %campaign_id,
                "Pass finished: {} sent, {} failed, {} blocked",
                report.sent, report.failed, report.blocked
            ),
            Err(e) => error!(campaign_id = %campaign_id, "Dispatch pass failed: {}", e),
        }
    });
}

pub async fn start_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<(StatusCode, Json<Campaign>)> {
    let campaign = state.engine.begin(&campaign_id)?;
    spawn_pass(state.engine.clone(), campaign_id);
    Ok((StatusCode::ACCEPTED, Json(campaign)))
}

pub async fn pause_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<Json<Campaign>> {
    Ok(Json(state.engine.pause(&campaign_id)?))
}

pub async fn resume_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<(StatusCode, Json<Campaign>)> {
    let campaign = state.engine.unpause(&campaign_id)?;
    spawn_pass(state.engine.clone(), campaign_id);
    Ok((StatusCode::ACCEPTED, Json(campaign)))
}

/// Requeue failed recipients and dispatch them
pub async fn retry_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<(StatusCode, Json<RetryResponse>)> {
    let requeued = state.engine.requeue_failed(&campaign_id)?;
    if requeued > 0 {
        spawn_pass(state.engine.clone(), campaign_id.clone());
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(RetryResponse {
            campaign_id,
            requeued,
        }),
    ))
}

/// Answer the Cloud API subscription challenge
pub async fn cloud_verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> std::result::Result<String, StatusCode> {
    let expected = state.config.api.cloud_verify_token.as_deref();
    match (
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        expected,
        query.challenge,
    ) {
        (Some("subscribe"), Some(token), Some(expected), Some(challenge)) if token == expected => {
            info!("Cloud webhook verified");
            Ok(challenge)
        }
        _ => {
            warn!("Cloud webhook verification rejected");
            Err(StatusCode::FORBIDDEN)
        }
    }
}

/// Receive delivery statuses and inbound messages from the Cloud API.
///
/// Always acknowledges with 200 so the provider does not redeliver;
/// per-item failures are logged.
pub async fn cloud_webhook(
    State(state): State<AppState>,
    Json(payload): Json<CloudWebhookPayload>,
) -> Json<WebhookSummary> {
    let mut summary = WebhookSummary::default();

    for status in payload.statuses() {
        let parsed = match status.status.parse::<RecipientStatus>() {
            Ok(RecipientStatus::Pending) | Err(_) => {
                debug!("Ignoring status '{}' for {}", status.status, status.id);
                continue;
            }
            Ok(parsed) => parsed,
        };
        let at = status.occurred_at().unwrap_or_else(Utc::now);
        match state
            .engine
            .apply_status_update(&status.id, parsed, status.error_title(), at)
        {
            Ok(true) => summary.statuses_applied += 1,
            Ok(false) => {}
            Err(e) => warn!("Failed to apply status for {}: {}", status.id, e),
        }
    }

    for (phone_number_id, message) in payload.messages() {
        match record_opt_out(&state, phone_number_id, message) {
            Ok(true) => summary.opt_outs += 1,
            Ok(false) => {}
            Err(e) => warn!("Failed to record opt-out from {}: {}", message.from, e),
        }
    }

    Json(summary)
}

/// Blacklist the sender when the message asks to stop receiving campaigns
fn record_opt_out(
    state: &AppState,
    phone_number_id: Option<&str>,
    message: &CloudMessage,
) -> Result<bool> {
    let Some(text) = message.body() else {
        return Ok(false);
    };
    let detection = detect_opt_out(text);
    let Some(reason) = detection.reason.filter(|_| detection.is_opt_out) else {
        return Ok(false);
    };
    let Some(phone_number_id) = phone_number_id else {
        warn!("Opt-out from {} without receiving number", message.from);
        return Ok(false);
    };

    let store = lock(&state.store)?;
    let Some(account) = store.get_account_by_phone_number_id(phone_number_id)? else {
        warn!("Opt-out for unknown phone number id {}", phone_number_id);
        return Ok(false);
    };
    let added = store.add_blacklist(&BlacklistEntry::new(&account.id, &message.from, reason))?;
    if added {
        info!(account_id = %account.id, "Blacklisted {} ({})", message.from, reason.as_str());
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    use wapush_campaign::{RecipientInput, TemplateSender};
    use wapush_core::{
        BusinessAccount, CampaignConfig, CampaignStatus, Config, SharedStore, Store,
    };
    use wapush_whatsapp::TemplateMessage;

    use crate::server::app;

    #[derive(Default)]
    struct FakeSender {
        sent: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl TemplateSender for FakeSender {
        async fn send_template(
            &self,
            _account: &BusinessAccount,
            to: &str,
            _template: &TemplateMessage,
        ) -> wapush_whatsapp::Result<String> {
            *self.sent.lock().unwrap().entry(to.to_string()).or_default() += 1;
            Ok(format!("wamid.{}", to))
        }
    }

    fn state(config: Config) -> AppState {
        let store = Store::in_memory().unwrap().shared();
        lock(&store)
            .unwrap()
            .upsert_account(&BusinessAccount {
                id: "acct-1".to_string(),
                name: "Loja".to_string(),
                phone_number_id: "1098765".to_string(),
                access_token: "token".to_string(),
            })
            .unwrap();
        let engine = DispatchEngine::new(
            store.clone(),
            Arc::new(FakeSender::default()),
            &CampaignConfig::default(),
        );
        AppState {
            config: Arc::new(config),
            store,
            engine: Arc::new(engine),
            sessions: None,
        }
    }

    fn draft(state: &AppState, phones: &[&str]) -> Campaign {
        let campaign = state
            .engine
            .create_campaign(Campaign::new("acct-1", "promo", "pt_BR"))
            .unwrap();
        let inputs = phones
            .iter()
            .map(|phone| RecipientInput {
                phone_number: phone.to_string(),
                name: None,
                variables: None,
            })
            .collect();
        state.engine.attach_recipients(&campaign.id, inputs).unwrap()
    }

    fn load_campaign(store: &SharedStore, id: &str) -> Campaign {
        lock(store).unwrap().get_campaign(id).unwrap().unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, value: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(state(Config::default()))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_session_routes_absent_without_manager() {
        let response = app(state(Config::default()))
            .oneshot(post("/api/sessions/loja-1/pair"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let mut config = Config::default();
        config.api.api_key = Some("secret".to_string());
        let state = state(config);
        let campaign = draft(&state, &["5511900000001"]);
        let uri = format!("/api/campaigns/{}/pause", campaign.id);

        let response = app(state.clone()).oneshot(post(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Authorized but the draft cannot be paused
        let request = Request::post(&uri)
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_campaign_dispatches_in_background() {
        let state = state(Config::default());
        let campaign = draft(&state, &["5511900000001", "5511900000002"]);
        let uri = format!("/api/campaigns/{}/start", campaign.id);

        let response = app(state.clone()).oneshot(post(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["status"], "running");

        for _ in 0..50 {
            if campaign_status(&state, &campaign.id) == CampaignStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let finished = load_campaign(&state.store, &campaign.id);
        assert_eq!(finished.status, CampaignStatus::Completed);
        assert_eq!(finished.sent_count, 2);

        // A second start is a conflict
        let response = app(state).oneshot(post(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    fn campaign_status(state: &AppState, id: &str) -> CampaignStatus {
        load_campaign(&state.store, id).status
    }

    #[tokio::test]
    async fn test_start_unknown_campaign_is_not_found() {
        let response = app(state(Config::default()))
            .oneshot(post("/api/campaigns/missing/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_start_without_recipients_is_conflict() {
        let state = state(Config::default());
        let campaign = draft(&state, &[]);
        let response = app(state)
            .oneshot(post(&format!("/api/campaigns/{}/start", campaign.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cloud_verify_handshake() {
        let mut config = Config::default();
        config.api.cloud_verify_token = Some("verify-me".to_string());
        let state = state(config);

        let ok = "/webhook/cloud?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345";
        let response = app(state.clone())
            .oneshot(Request::get(ok).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"12345");

        let bad = "/webhook/cloud?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=12345";
        let response = app(state)
            .oneshot(Request::get(bad).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_webhook_applies_statuses_and_opt_outs() {
        let state = state(Config::default());
        let campaign = draft(&state, &["5511900000001", "5511900000002"]);
        state.engine.start(&campaign.id).await.unwrap();

        let payload = serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "waba-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "metadata": { "phone_number_id": "1098765" },
                        "statuses": [
                            { "id": "wamid.5511900000001", "status": "read", "timestamp": "1760000000" },
                            { "id": "wamid.5511900000002", "status": "delivered" },
                            { "id": "wamid.unknown", "status": "delivered" }
                        ],
                        "messages": [
                            { "from": "5511900000002", "id": "wamid.in1", "type": "text", "text": { "body": " PARAR " } },
                            { "from": "5511900000003", "id": "wamid.in2", "type": "text", "text": { "body": "obrigado!" } }
                        ]
                    }
                }]
            }]
        });
        let response = app(state.clone())
            .oneshot(post_json("/webhook/cloud", payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary = body_json(response).await;
        assert_eq!(summary["statuses_applied"], 2);
        assert_eq!(summary["opt_outs"], 1);

        let updated = load_campaign(&state.store, &campaign.id);
        assert_eq!(updated.read_count, 1);
        // read implies delivered
        assert_eq!(updated.delivered_count, 2);

        let blocked = lock(&state.store)
            .unwrap()
            .blacklisted_numbers("acct-1")
            .unwrap();
        assert_eq!(blocked.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_webhook_late_failure_does_not_regress() {
        let state = state(Config::default());
        let campaign = draft(&state, &["5511900000001"]);
        state.engine.start(&campaign.id).await.unwrap();

        let read = serde_json::json!({ "entry": [{ "changes": [{ "value": {
            "statuses": [{ "id": "wamid.5511900000001", "status": "read" }]
        }}]}]});
        app(state.clone())
            .oneshot(post_json("/webhook/cloud", read))
            .await
            .unwrap();

        let failed = serde_json::json!({ "entry": [{ "changes": [{ "value": {
            "statuses": [{
                "id": "wamid.5511900000001",
                "status": "failed",
                "errors": [{ "code": 131026, "title": "Message undeliverable" }]
            }]
        }}]}]});
        let response = app(state.clone())
            .oneshot(post_json("/webhook/cloud", failed))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["statuses_applied"], 0);

        let updated = load_campaign(&state.store, &campaign.id);
        assert_eq!(updated.read_count, 1);
        assert_eq!(updated.failed_count, 0);
    }
}
