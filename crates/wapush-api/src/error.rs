//! エラー型定義 (wapush-api)

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use wapush_campaign::CampaignError;
use wapush_whatsapp::WhatsAppError;

/// wapush-api のエラー型
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Session management is not enabled")]
    SessionsDisabled,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Generic API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::SessionsDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("API error: {}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

impl From<CampaignError> for ApiError {
    fn from(err: CampaignError) -> Self {
        match err {
            CampaignError::NotFound(_) => Self::NotFound(err.to_string()),
            CampaignError::InvalidTransition { .. } | CampaignError::NoPendingRecipients(_) => {
                Self::Conflict(err.to_string())
            }
            CampaignError::AccountNotFound(_) => Self::InvalidRequest(err.to_string()),
            CampaignError::Core(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<WhatsAppError> for ApiError {
    fn from(err: WhatsAppError) -> Self {
        match err {
            WhatsAppError::Pairing { .. } | WhatsAppError::Transport(_) => {
                Self::Upstream(err.to_string())
            }
            WhatsAppError::NotConnected(_) => Self::Conflict(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<wapush_core::Error> for ApiError {
    fn from(err: wapush_core::Error) -> Self {
        match err {
            wapush_core::Error::NotFound(_) => Self::NotFound(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result 型エイリアス
pub type Result<T> = std::result::Result<T, ApiError>;
