//! Transport contract
//!
//! The wire protocol (WhatsApp multi-device, Telegram, ...) lives behind
//! these traits. The session manager only opens handles, reacts to the
//! events they emit, and closes them again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;

/// Persisted credential material of one session.
///
/// The manager never looks inside the blob; it only needs to know whether
/// credentials exist and whether they carry a verified self identity.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub credentials: Option<Vec<u8>>,
    /// Verified "self" identity (the paired phone's JID)
    pub self_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCompleteness {
    Absent,
    /// Credentials without a verified identity: a half-finished pairing
    Partial,
    Complete,
}

impl AuthState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn completeness(&self) -> AuthCompleteness {
        match (&self.credentials, &self.self_id) {
            (None, _) => AuthCompleteness::Absent,
            (Some(_), None) => AuthCompleteness::Partial,
            (Some(_), Some(_)) => AuthCompleteness::Complete,
        }
    }
}

/// Why a transport connection closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The device was unlinked; credentials are no longer valid
    LoggedOut,
    /// Network or protocol failure worth retrying with backoff
    ConnectionFailure(String),
    /// Anything else (restart requests, replaced streams, unknown codes)
    Other(String),
}

impl CloseReason {
    /// Classify a WhatsApp Web disconnect status code
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            408 => Self::ConnectionFailure("connection lost or timed out".to_string()),
            428 => Self::ConnectionFailure("connection closed".to_string()),
            500 => Self::ConnectionFailure("bad session".to_string()),
            503 => Self::ConnectionFailure("service unavailable".to_string()),
            other => Self::Other(format!("closed with status {}", other)),
        }
    }
}

/// An inbound chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from: String,
    pub message_id: String,
    pub timestamp: i64,
    pub text: String,
}

/// Events emitted by an open transport handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    QrCode(String),
    ConnectionOpened { phone_number: Option<String> },
    ConnectionClosed(CloseReason),
    MessageReceived(InboundMessage),
}

/// Factory side of a messaging transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Load persisted credentials, returning an empty state when none exist
    async fn load_auth_state(&self, session_id: &str) -> Result<AuthState>;

    /// Delete persisted credentials. Must succeed when nothing is stored.
    async fn clear_auth_state(&self, session_id: &str) -> Result<()>;

    /// Open a connection. Events for this handle are pushed into `events`.
    async fn open(
        &self,
        session_id: &str,
        auth: AuthState,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn TransportHandle>>;
}

/// A live connection
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send a text message, returning the provider message id
    async fn send(&self, recipient: &str, content: &str) -> Result<String>;

    /// Check whether a phone number has an account; returns its JID
    async fn check_registered(&self, phone: &str) -> Result<Option<String>>;

    /// Graceful shutdown of the connection
    async fn end(&self) -> Result<()>;

    /// Forced close of the underlying socket
    fn close(&self) -> Result<()>;
}
