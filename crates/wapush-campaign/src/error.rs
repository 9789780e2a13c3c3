//! Error types for wapush-campaign

use thiserror::Error;
use wapush_core::CampaignStatus;

/// wapush-campaign error type
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} campaign {campaign_id} while {status}")]
    InvalidTransition {
        campaign_id: String,
        status: CampaignStatus,
        action: &'static str,
    },

    #[error("Campaign {0} has no pending recipients")]
    NoPendingRecipients(String),

    #[error("Business account not found: {0}")]
    AccountNotFound(String),

    #[error("Core error: {0}")]
    Core(#[from] wapush_core::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CampaignError>;
