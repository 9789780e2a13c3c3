//! WhatsApp Business Cloud API client and webhook payload types

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use wapush_core::{BusinessAccount, CloudApiConfig};

use crate::error::{Result, WhatsAppError};

/// Template send request: name, language and ordered body parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateMessage {
    pub name: String,
    pub language: String,
    pub parameters: Vec<String>,
}

/// Cloud API client
#[derive(Debug, Clone)]
pub struct CloudApiClient {
    client: Client,
    base_url: String,
    api_version: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

impl CloudApiClient {
    pub fn new(config: &CloudApiConfig, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WhatsAppError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
        })
    }

    fn messages_url(&self, account: &BusinessAccount) -> String {
        format!(
            "{}/{}/{}/messages",
            self.base_url, self.api_version, account.phone_number_id
        )
    }

    /// Send an approved template, returning the provider message id
    pub async fn send_template(
        &self,
        account: &BusinessAccount,
        to: &str,
        template: &TemplateMessage,
    ) -> Result<String> {
        info!("Sending template {} to {}", template.name, to);
        self.post_message(account, &template_payload(to, template)).await
    }

    /// Send a free-form text message (only inside a customer service window)
    pub async fn send_text(&self, account: &BusinessAccount, to: &str, body: &str) -> Result<String> {
        info!("Sending text message to {}", to);
        self.post_message(account, &text_payload(to, body)).await
    }

    async fn post_message(&self, account: &BusinessAccount, payload: &Value) -> Result<String> {
        let response = self
            .client
            .post(self.messages_url(account))
            .bearer_auth(&account.access_token)
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WhatsAppError::Api(format!(
                "Failed to send message: {} - {}",
                status, text
            )));
        }

        let result: SendResponse = response.json().await?;
        let id = result
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| WhatsAppError::Api("response carried no message id".to_string()))?;
        debug!("Accepted as {}", id);
        Ok(id)
    }
}

/// Build the JSON body of a template send. Without parameters no
/// `components` key is emitted.
pub fn template_payload(to: &str, template: &TemplateMessage) -> Value {
    let mut body = json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "template",
        "template": {
            "name": template.name,
            "language": { "code": template.language },
        },
    });

    if !template.parameters.is_empty() {
        let parameters: Vec<Value> = template
            .parameters
            .iter()
            .map(|text| json!({ "type": "text", "text": text }))
            .collect();
        body["template"]["components"] = json!([{ "type": "body", "parameters": parameters }]);
    }
    body
}

pub fn text_payload(to: &str, body: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "text",
        "text": { "body": body },
    })
}

// Webhook payloads (POST /webhook/cloud)

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CloudWebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<WebhookMetadata>,
    #[serde(default)]
    pub messages: Vec<CloudMessage>,
    #[serde(default)]
    pub statuses: Vec<CloudStatus>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookMetadata {
    pub phone_number_id: String,
    #[serde(default)]
    pub display_phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudMessage {
    pub from: String,
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub button: Option<ButtonReply>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextBody {
    pub body: String,
}

/// Quick-reply button press on a template
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ButtonReply {
    pub text: String,
}

impl CloudMessage {
    /// Text typed or tapped by the user
    pub fn body(&self) -> Option<&str> {
        self.text
            .as_ref()
            .map(|t| t.body.as_str())
            .or_else(|| self.button.as_ref().map(|b| b.text.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudStatus {
    /// Provider message id returned by the send call
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<CloudError>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
}

impl CloudStatus {
    /// Unix-seconds timestamp of the status change, if present and valid
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.timestamp.as_deref()?.parse::<i64>().ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }

    /// Title of the first reported error
    pub fn error_title(&self) -> Option<String> {
        self.errors.first().map(|e| match (&e.title, e.code) {
            (Some(title), _) => title.clone(),
            (None, Some(code)) => format!("error {}", code),
            (None, None) => "unknown error".to_string(),
        })
    }
}

impl CloudWebhookPayload {
    fn values(&self) -> impl Iterator<Item = &ChangeValue> {
        self.entry
            .iter()
            .flat_map(|e| e.changes.iter())
            .map(|c| &c.value)
    }

    pub fn statuses(&self) -> impl Iterator<Item = &CloudStatus> {
        self.values().flat_map(|v| v.statuses.iter())
    }

    /// Inbound messages paired with the receiving phone number id
    pub fn messages(&self) -> impl Iterator<Item = (Option<&str>, &CloudMessage)> {
        self.values().flat_map(|v| {
            let phone_number_id = v.metadata.as_ref().map(|m| m.phone_number_id.as_str());
            v.messages.iter().map(move |m| (phone_number_id, m))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{extract::Path, http::HeaderMap, routing::post, Json, Router};

    fn account() -> BusinessAccount {
        BusinessAccount {
            id: "acct-1".to_string(),
            name: "Loja".to_string(),
            phone_number_id: "1098765".to_string(),
            access_token: "EAAG-token".to_string(),
        }
    }

    #[test]
    fn test_template_payload_omits_empty_components() {
        let template = TemplateMessage {
            name: "promo".to_string(),
            language: "pt_BR".to_string(),
            parameters: vec![],
        };
        let payload = template_payload("5511900000001", &template);
        assert_eq!(payload["template"]["language"]["code"], "pt_BR");
        assert!(payload["template"].get("components").is_none());

        let template = TemplateMessage {
            parameters: vec!["Maria".to_string(), "10%".to_string()],
            ..template
        };
        let payload = template_payload("5511900000001", &template);
        let params = &payload["template"]["components"][0]["parameters"];
        assert_eq!(params[0]["text"], "Maria");
        assert_eq!(params[1]["text"], "10%");
    }

    #[test]
    fn test_parse_status_webhook() {
        let raw = r#"{
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {"display_phone_number": "5511", "phone_number_id": "1098765"},
                        "statuses": [
                            {"id": "wamid.A", "status": "delivered", "timestamp": "1700000000", "recipient_id": "5511900000001"},
                            {"id": "wamid.B", "status": "failed", "timestamp": "1700000001",
                             "errors": [{"code": 131026, "title": "Message undeliverable"}]}
                        ],
                        "messages": [
                            {"from": "5511900000003", "id": "wamid.C", "timestamp": "1700000002", "type": "text", "text": {"body": "PARAR"}}
                        ]
                    }
                }]
            }]
        }"#;
        let payload: CloudWebhookPayload = serde_json::from_str(raw).unwrap();

        let statuses: Vec<_> = payload.statuses().collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].occurred_at().unwrap().timestamp(), 1_700_000_000);
        assert_eq!(statuses[1].error_title().as_deref(), Some("Message undeliverable"));

        let messages: Vec<_> = payload.messages().collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, Some("1098765"));
        assert_eq!(messages[0].1.body(), Some("PARAR"));
    }

    #[tokio::test]
    async fn test_send_template_posts_with_bearer_token() {
        async fn messages(
            Path((version, phone_id)): Path<(String, String)>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            assert_eq!(version, "v21.0");
            assert_eq!(phone_id, "1098765");
            assert_eq!(headers["authorization"], "Bearer EAAG-token");
            assert_eq!(body["template"]["name"], "promo");
            Json(json!({"messages": [{"id": "wamid.XYZ"}]}))
        }

        let app = Router::new().route("/{version}/{phone_id}/messages", post(messages));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = CloudApiConfig {
            base_url: format!("http://{}/", addr),
            api_version: "v21.0".to_string(),
        };
        let client = CloudApiClient::new(&config, Duration::from_secs(5)).unwrap();
        let template = TemplateMessage {
            name: "promo".to_string(),
            language: "pt_BR".to_string(),
            parameters: vec!["Maria".to_string()],
        };
        let id = client
            .send_template(&account(), "5511900000001", &template)
            .await
            .unwrap();
        assert_eq!(id, "wamid.XYZ");
    }

    #[tokio::test]
    async fn test_send_surfaces_api_errors() {
        async fn reject() -> (axum::http::StatusCode, &'static str) {
            (axum::http::StatusCode::BAD_REQUEST, "template not approved")
        }

        let app = Router::new().route("/{version}/{phone_id}/messages", post(reject));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = CloudApiConfig {
            base_url: format!("http://{}", addr),
            api_version: "v21.0".to_string(),
        };
        let client = CloudApiClient::new(&config, Duration::from_secs(5)).unwrap();
        let err = client
            .send_text(&account(), "5511900000001", "oi")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("template not approved"));
    }
}
