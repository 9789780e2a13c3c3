//! Error types for wapush-whatsapp

use thiserror::Error;

/// wapush-whatsapp error type
#[derive(Error, Debug)]
pub enum WhatsAppError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Pairing failed for session {session_id}: {reason}")]
    Pairing { session_id: String, reason: String },

    #[error("Session not connected: {0}")]
    NotConnected(String),

    #[error("Cloud API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] wapush_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for WhatsAppError {
    fn from(err: reqwest::Error) -> Self {
        WhatsAppError::Http(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, WhatsAppError>;
