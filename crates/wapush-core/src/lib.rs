//! wapush-core: shared foundation for the wapush gateway
//!
//! Entity models, SQLite persistence, the blacklist filtering contract
//! and configuration loading used by every other wapush crate.

pub mod blacklist;
pub mod config;
pub mod error;
pub mod models;
pub mod store;

pub use blacklist::{detect_opt_out, normalize_phone, FilterOutcome, OptOutDetection};
pub use config::{
    ApiConfig, CampaignConfig, CloudApiConfig, Config, DatabaseConfig, SchedulerConfig,
    SessionConfig, WebhookConfig,
};
pub use error::{Error, Result};
pub use models::{
    BlacklistEntry, BlacklistReason, BusinessAccount, Campaign, CampaignCounts, CampaignRecipient,
    CampaignStatus, MessageTemplate, RecipientStatus, SessionRecord, SessionWebhook,
    RECIPIENT_NAME_SENTINEL,
};
pub use store::{SharedStore, Store};
