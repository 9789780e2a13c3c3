//! Outbound template send contract

use async_trait::async_trait;
use wapush_core::BusinessAccount;
use wapush_whatsapp::{CloudApiClient, TemplateMessage};

/// Anything that can deliver an approved template to a phone number
#[async_trait]
pub trait TemplateSender: Send + Sync {
    /// Returns the provider message id used to correlate status webhooks
    async fn send_template(
        &self,
        account: &BusinessAccount,
        to: &str,
        template: &TemplateMessage,
    ) -> wapush_whatsapp::Result<String>;
}

#[async_trait]
impl TemplateSender for CloudApiClient {
    async fn send_template(
        &self,
        account: &BusinessAccount,
        to: &str,
        template: &TemplateMessage,
    ) -> wapush_whatsapp::Result<String> {
        CloudApiClient::send_template(self, account, to, template).await
    }
}
