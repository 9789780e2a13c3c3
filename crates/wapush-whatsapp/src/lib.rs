//! wapush-whatsapp: WhatsApp connection layer for wapush
//!
//! Owns the long-lived device sessions (pairing, reconnection, credential
//! cleanup) on top of an injected [`Transport`], forwards inbound messages
//! to per-session webhooks, and talks to the WhatsApp Business Cloud API.

pub mod backoff;
pub mod cloud;
pub mod error;
pub mod forwarder;
pub mod machine;
pub mod manager;
pub mod registry;
pub mod timer;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use cloud::{CloudApiClient, CloudStatus, CloudWebhookPayload, TemplateMessage};
pub use error::{Result, WhatsAppError};
pub use forwarder::{ForwardOutcome, WebhookForwarder};
pub use machine::{SessionEvent, SessionMachine, SessionState, StatusUpdate};
pub use manager::{SessionManager, SessionStatus};
pub use registry::{InMemoryRegistry, LiveSession, SessionRegistry};
pub use transport::{
    AuthCompleteness, AuthState, CloseReason, InboundMessage, Transport, TransportEvent,
    TransportHandle,
};
