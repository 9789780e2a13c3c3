//! Forwarding of inbound messages to configured webhooks
//!
//! Destination lookup: per-session webhook from the in-memory cache, then a
//! forced cache refresh from the store, then the legacy global URL.
//! Delivery is attempted once; failures are logged and dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use wapush_core::store::{lock, SharedStore};
use wapush_core::{SessionWebhook, WebhookConfig};

use crate::error::{Result, WhatsAppError};
use crate::transport::InboundMessage;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const SECRET_HEADER: &str = "x-webhook-secret";

/// JSON body posted to the webhook
#[derive(Debug, Clone, Serialize)]
pub struct ForwardPayload<'a> {
    pub connection_name: &'a str,
    pub from: &'a str,
    pub message_id: &'a str,
    pub timestamp: i64,
    pub text: &'a str,
}

/// Where a message will be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Session(SessionWebhook),
    Legacy(String),
}

impl Destination {
    fn url(&self) -> &str {
        match self {
            Self::Session(w) => &w.url,
            Self::Legacy(url) => url,
        }
    }

    fn secret(&self) -> Option<&str> {
        match self {
            Self::Session(w) => w.secret.as_deref().filter(|s| !s.is_empty()),
            Self::Legacy(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered(u16),
    /// Destination answered with a non-2xx status
    Rejected(u16),
    /// No destination configured
    Dropped,
}

#[derive(Default)]
struct WebhookCache {
    entries: HashMap<String, SessionWebhook>,
    loaded_at: Option<Instant>,
}

pub struct WebhookForwarder {
    client: Client,
    store: SharedStore,
    cache: RwLock<WebhookCache>,
    legacy_url: Option<String>,
    cache_ttl: Duration,
}

impl WebhookForwarder {
    pub fn new(store: SharedStore, config: &WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| WhatsAppError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            store,
            cache: RwLock::new(WebhookCache::default()),
            legacy_url: config.legacy_url.clone().filter(|u| !u.is_empty()),
            cache_ttl: config.cache_ttl(),
        })
    }

    /// Reload the per-session webhook cache from the store
    pub async fn refresh(&self) -> Result<()> {
        let webhooks = {
            let store = lock(&self.store)?;
            store.list_session_webhooks()?
        };

        let mut cache = self.cache.write().await;
        cache.entries = webhooks
            .into_iter()
            .map(|w| (w.session_id.clone(), w))
            .collect();
        cache.loaded_at = Some(Instant::now());
        debug!("Webhook cache refreshed ({} entries)", cache.entries.len());
        Ok(())
    }

    async fn cached(&self, session_id: &str) -> (Option<SessionWebhook>, bool) {
        let cache = self.cache.read().await;
        let fresh = cache
            .loaded_at
            .is_some_and(|at| at.elapsed() < self.cache_ttl);
        (cache.entries.get(session_id).cloned(), fresh)
    }

    /// Resolve the destination for a session's inbound messages
    pub async fn resolve(&self, session_id: &str) -> Option<Destination> {
        let (cached, fresh) = self.cached(session_id).await;
        if let (Some(webhook), true) = (&cached, fresh) {
            return Some(Destination::Session(webhook.clone()));
        }

        match self.refresh().await {
            Ok(()) => {
                if let (Some(webhook), _) = self.cached(session_id).await {
                    return Some(Destination::Session(webhook));
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, "Webhook cache refresh failed: {}", e);
                if let Some(webhook) = cached {
                    return Some(Destination::Session(webhook));
                }
            }
        }

        self.legacy_url.clone().map(Destination::Legacy)
    }

    /// Forward one inbound message. At most one delivery attempt is made.
    pub async fn forward(&self, session_id: &str, message: &InboundMessage) -> Result<ForwardOutcome> {
        let Some(destination) = self.resolve(session_id).await else {
            info!(session_id = %session_id, "No webhook configured, dropping inbound message");
            return Ok(ForwardOutcome::Dropped);
        };

        let payload = ForwardPayload {
            connection_name: session_id,
            from: &message.from,
            message_id: &message.message_id,
            timestamp: message.timestamp,
            text: &message.text,
        };
        let body = serde_json::to_string(&payload)?;

        let mut request = self
            .client
            .post(destination.url())
            .header(CONTENT_TYPE, "application/json");
        if let Some(secret) = destination.secret() {
            if let Some(signature) = sign_payload(secret, &body) {
                request = request.header(SIGNATURE_HEADER, format!("sha256={}", signature));
            }
            request = request.header(SECRET_HEADER, secret);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(session_id = %session_id, "Forwarded message {} ({})", message.message_id, status);
            return Ok(ForwardOutcome::Delivered(status.as_u16()));
        }

        let text = response.text().await.unwrap_or_default();
        warn!(
            session_id = %session_id,
            status = %status,
            "Webhook rejected message {}: {}",
            message.message_id,
            text
        );
        Ok(ForwardOutcome::Rejected(status.as_u16()))
    }
}

/// Hex HMAC-SHA256 of the body keyed by the webhook secret
pub fn sign_payload(secret: &str, body: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Router};
    use wapush_core::Store;

    type Captured = Arc<Mutex<Vec<(HeaderMap, String)>>>;

    async fn capture(State(captured): State<Captured>, headers: HeaderMap, body: Bytes) -> &'static str {
        captured
            .lock()
            .unwrap()
            .push((headers, String::from_utf8_lossy(&body).to_string()));
        "ok"
    }

    async fn spawn_receiver() -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hook", post(capture))
            .with_state(Arc::clone(&captured));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/hook", addr), captured)
    }

    fn message() -> InboundMessage {
        InboundMessage {
            from: "5511999990000".to_string(),
            message_id: "3EB0ABC".to_string(),
            timestamp: 1_700_000_000,
            text: "Oi".to_string(),
        }
    }

    fn config(legacy: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            legacy_url: legacy.map(str::to_string),
            ..WebhookConfig::default()
        }
    }

    #[test]
    fn test_sign_payload() {
        let signature = sign_payload("secret", "{\"a\":1}").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sign_payload("secret", "{\"a\":1}").unwrap(), signature);
        assert_ne!(sign_payload("other", "{\"a\":1}").unwrap(), signature);
    }

    #[tokio::test]
    async fn test_resolution_prefers_session_then_legacy() {
        let store = Store::in_memory().unwrap().shared();
        let forwarder = WebhookForwarder::new(store.clone(), &config(Some("https://legacy.example.com"))).unwrap();

        assert_eq!(
            forwarder.resolve("s1").await,
            Some(Destination::Legacy("https://legacy.example.com".to_string()))
        );

        // Added after the cache was loaded: the forced refresh must find it
        let webhook = SessionWebhook {
            session_id: "s1".to_string(),
            url: "https://s1.example.com".to_string(),
            secret: None,
        };
        lock(&store).unwrap().set_session_webhook(&webhook).unwrap();
        assert_eq!(forwarder.resolve("s1").await, Some(Destination::Session(webhook)));
    }

    #[tokio::test]
    async fn test_no_destination_drops() {
        let store = Store::in_memory().unwrap().shared();
        let forwarder = WebhookForwarder::new(store, &config(None)).unwrap();
        assert_eq!(
            forwarder.forward("s1", &message()).await.unwrap(),
            ForwardOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn test_forward_signs_body() {
        let (url, captured) = spawn_receiver().await;
        let store = Store::in_memory().unwrap().shared();
        lock(&store)
            .unwrap()
            .set_session_webhook(&SessionWebhook {
                session_id: "vendas".to_string(),
                url,
                secret: Some("s3cr3t".to_string()),
            })
            .unwrap();
        let forwarder = WebhookForwarder::new(store, &config(None)).unwrap();

        let outcome = forwarder.forward("vendas", &message()).await.unwrap();
        assert_eq!(outcome, ForwardOutcome::Delivered(200));

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (headers, body) = &captured[0];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["connection_name"], "vendas");
        assert_eq!(json["from"], "5511999990000");
        assert_eq!(json["text"], "Oi");
        assert_eq!(headers.get(SECRET_HEADER).unwrap(), "s3cr3t");
        let signature = headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert_eq!(signature, format!("sha256={}", sign_payload("s3cr3t", body).unwrap()));
    }

    #[tokio::test]
    async fn test_legacy_rejection_is_reported() {
        let store = Store::in_memory().unwrap().shared();
        let (url, _captured) = spawn_receiver().await;
        let missing = url.replace("/hook", "/missing");
        let forwarder = WebhookForwarder::new(store, &config(Some(&missing))).unwrap();

        let outcome = forwarder.forward("s1", &message()).await.unwrap();
        assert_eq!(outcome, ForwardOutcome::Rejected(404));
    }
}
