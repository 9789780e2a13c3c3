//! Entity models shared by the session, campaign and webhook layers

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Template variable value meaning "substitute the recipient's stored name"
pub const RECIPIENT_NAME_SENTINEL: &str = "__RECIPIENT_NAME__";

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidData(format!("unknown campaign status: {}", other))),
        }
    }
}

/// Per-recipient delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Progress rank along `sent < delivered < read`.
    ///
    /// `pending` and `failed` sit outside the delivery progression and rank 0.
    pub fn delivery_rank(&self) -> u8 {
        match self {
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Pending | Self::Failed => 0,
        }
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecipientStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidData(format!("unknown recipient status: {}", other))),
        }
    }
}

/// Why a number was blacklisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistReason {
    OptOutKeyword,
    SpamReport,
    Manual,
    Bounce,
}

impl BlacklistReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptOutKeyword => "opt_out_keyword",
            Self::SpamReport => "spam_report",
            Self::Manual => "manual",
            Self::Bounce => "bounce",
        }
    }
}

impl FromStr for BlacklistReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "opt_out_keyword" => Ok(Self::OptOutKeyword),
            "spam_report" => Ok(Self::SpamReport),
            "manual" => Ok(Self::Manual),
            "bounce" => Ok(Self::Bounce),
            other => Err(Error::InvalidData(format!("unknown blacklist reason: {}", other))),
        }
    }
}

/// A marketing campaign sending one template to many recipients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub business_account_id: String,
    pub template_name: String,
    pub template_language: String,
    /// Campaign-wide variables; a value may be [`RECIPIENT_NAME_SENTINEL`]
    pub template_variables: BTreeMap<String, String>,
    pub status: CampaignStatus,
    pub total_recipients: u32,
    pub sent_count: u32,
    pub delivered_count: u32,
    pub read_count: u32,
    pub failed_count: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub auto_retry_enabled: bool,
    pub max_retries: u32,
    pub retry_delay_minutes: u32,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    /// Create a new draft campaign
    pub fn new(
        business_account_id: impl Into<String>,
        template_name: impl Into<String>,
        template_language: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            business_account_id: business_account_id.into(),
            template_name: template_name.into(),
            template_language: template_language.into(),
            template_variables: BTreeMap::new(),
            status: CampaignStatus::Draft,
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            auto_retry_enabled: false,
            max_retries: 3,
            retry_delay_minutes: 30,
            created_at: Utc::now(),
        }
    }

    /// Copy recomputed aggregates onto the campaign row
    pub fn apply_counts(&mut self, counts: &CampaignCounts) {
        self.total_recipients = counts.total;
        self.sent_count = counts.sent;
        self.delivered_count = counts.delivered;
        self.read_count = counts.read;
        self.failed_count = counts.failed;
    }
}

/// One (campaign, phone number) unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecipient {
    pub id: String,
    pub campaign_id: String,
    pub phone_number: String,
    pub name: Option<String>,
    /// Per-recipient overrides of the campaign variables
    pub variables: Option<BTreeMap<String, String>>,
    pub status: RecipientStatus,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl CampaignRecipient {
    pub fn new(
        campaign_id: impl Into<String>,
        phone_number: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            phone_number: phone_number.into(),
            name,
            variables: None,
            status: RecipientStatus::Pending,
            provider_message_id: None,
            error_message: None,
            retry_count: 0,
            sent_at: None,
            last_attempt_at: None,
        }
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn mark_sent(&mut self, message_id: impl Into<String>, at: DateTime<Utc>) {
        self.status = RecipientStatus::Sent;
        self.provider_message_id = Some(message_id.into());
        self.error_message = None;
        self.sent_at = Some(at);
        self.last_attempt_at = Some(at);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = RecipientStatus::Failed;
        self.error_message = Some(error.into());
        self.last_attempt_at = Some(at);
    }
}

/// Aggregate counters recomputed from the full recipient set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CampaignCounts {
    pub total: u32,
    pub sent: u32,
    pub delivered: u32,
    pub read: u32,
    pub failed: u32,
    pub pending: u32,
}

impl CampaignCounts {
    /// Tally recipient statuses. `read` implies `delivered` implies `sent`.
    pub fn tally<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a RecipientStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            counts.total += 1;
            match status {
                RecipientStatus::Pending => counts.pending += 1,
                RecipientStatus::Failed => counts.failed += 1,
                delivered => {
                    let rank = delivered.delivery_rank();
                    counts.sent += 1;
                    if rank >= 2 {
                        counts.delivered += 1;
                    }
                    if rank >= 3 {
                        counts.read += 1;
                    }
                }
            }
        }
        counts
    }
}

/// Per-account excluded number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub business_account_id: String,
    pub phone_number: String,
    pub reason: BlacklistReason,
    pub created_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn new(
        business_account_id: impl Into<String>,
        phone_number: impl Into<String>,
        reason: BlacklistReason,
    ) -> Self {
        Self {
            business_account_id: business_account_id.into(),
            phone_number: phone_number.into(),
            reason,
            created_at: Utc::now(),
        }
    }
}

/// Cloud API account credentials a campaign sends through
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessAccount {
    pub id: String,
    pub name: String,
    pub phone_number_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
}

/// Approved message template body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub account_id: String,
    pub name: String,
    pub language: String,
    /// Body text with `{{1}}` / `{{name}}` placeholders
    pub body: String,
}

/// Display mirror of a device session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: String,
    pub phone_number: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Where inbound messages of a session are forwarded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWebhook {
    pub session_id: String,
    pub url: String,
    pub secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_defaults() {
        let campaign = Campaign::new("acct-1", "promo", "pt_BR");
        assert_eq!(campaign.status, CampaignStatus::Draft);
        assert_eq!(campaign.total_recipients, 0);
        assert!(!campaign.auto_retry_enabled);
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!("paused".parse::<CampaignStatus>().unwrap(), CampaignStatus::Paused);
        assert_eq!(RecipientStatus::Delivered.to_string(), "delivered");
        assert!("archived".parse::<CampaignStatus>().is_err());
        assert_eq!(
            "opt_out_keyword".parse::<BlacklistReason>().unwrap(),
            BlacklistReason::OptOutKeyword
        );
    }

    #[test]
    fn test_counts_are_cumulative() {
        let statuses = [
            RecipientStatus::Read,
            RecipientStatus::Delivered,
            RecipientStatus::Sent,
            RecipientStatus::Failed,
            RecipientStatus::Pending,
        ];
        let counts = CampaignCounts::tally(statuses.iter());
        assert_eq!(counts.total, 5);
        assert_eq!(counts.sent, 3);
        assert_eq!(counts.delivered, 2);
        assert_eq!(counts.read, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);
        assert!(counts.sent + counts.failed <= counts.total);
    }

    #[test]
    fn test_recipient_marking() {
        let now = Utc::now();
        let mut recipient = CampaignRecipient::new("c1", "5511999990000", None);
        recipient.mark_failed("timeout", now);
        assert_eq!(recipient.status, RecipientStatus::Failed);

        recipient.mark_sent("wamid.1", now);
        assert_eq!(recipient.status, RecipientStatus::Sent);
        assert!(recipient.error_message.is_none());
        assert_eq!(recipient.provider_message_id.as_deref(), Some("wamid.1"));
    }
}
