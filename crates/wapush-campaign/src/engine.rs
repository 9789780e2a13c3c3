//! Campaign dispatch engine
//!
//! Campaign status moves `draft → (scheduled) → running ↔ paused →
//! completed | failed`. A dispatch pass walks the pending recipients in
//! attachment order, one send at a time, and recomputes the aggregates from
//! the full recipient set when it finishes.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use wapush_core::store::{lock, SharedStore};
use wapush_core::{
    BusinessAccount, Campaign, CampaignConfig, CampaignRecipient, CampaignStatus, MessageTemplate,
    RecipientStatus,
};
use wapush_whatsapp::TemplateMessage;

use crate::error::{CampaignError, Result};
use crate::pacing::{FixedPacing, PacingPolicy};
use crate::sender::TemplateSender;
use crate::template::{build_parameters, resolve_variables};

/// Error recorded on recipients skipped because of the blacklist
pub const BLACKLISTED_ERROR: &str = "blacklisted (opt-out)";

/// Recipient as supplied when attaching to a campaign
#[derive(Debug, Clone, Deserialize)]
pub struct RecipientInput {
    pub phone_number: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variables: Option<BTreeMap<String, String>>,
}

/// Outcome of one dispatch pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub campaign: Campaign,
    pub sent: u32,
    pub failed: u32,
    pub blocked: u32,
    /// The pass stopped early because the campaign left `running`
    pub interrupted: bool,
}

pub struct DispatchEngine {
    store: SharedStore,
    sender: Arc<dyn TemplateSender>,
    pacing: Arc<dyn PacingPolicy>,
    send_timeout: Duration,
    /// Campaigns with a pass in progress
    active: Mutex<HashSet<String>>,
}

/// Marks a campaign as being dispatched until dropped
struct PassGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    campaign_id: String,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.campaign_id);
        }
    }
}

impl DispatchEngine {
    pub fn new(store: SharedStore, sender: Arc<dyn TemplateSender>, config: &CampaignConfig) -> Self {
        Self {
            store,
            sender,
            pacing: Arc::new(FixedPacing::from_config(config)),
            send_timeout: config.send_timeout(),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_pacing(mut self, pacing: Arc<dyn PacingPolicy>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn load(&self, campaign_id: &str) -> Result<Campaign> {
        lock(&self.store)?
            .get_campaign(campaign_id)?
            .ok_or_else(|| CampaignError::NotFound(campaign_id.to_string()))
    }

    fn save(&self, campaign: &Campaign) -> Result<()> {
        lock(&self.store)?.save_campaign(campaign)?;
        Ok(())
    }

    fn expect_status(
        campaign: &Campaign,
        allowed: &[CampaignStatus],
        action: &'static str,
    ) -> Result<()> {
        if allowed.contains(&campaign.status) {
            Ok(())
        } else {
            Err(CampaignError::InvalidTransition {
                campaign_id: campaign.id.clone(),
                status: campaign.status,
                action,
            })
        }
    }

    /// Store a new campaign in `draft`
    pub fn create_campaign(&self, mut campaign: Campaign) -> Result<Campaign> {
        campaign.status = CampaignStatus::Draft;
        campaign.apply_counts(&Default::default());
        self.save(&campaign)?;
        info!(campaign_id = %campaign.id, "Campaign created");
        Ok(campaign)
    }

    /// Attach recipients to a draft or scheduled campaign
    pub fn attach_recipients(&self, campaign_id: &str, inputs: Vec<RecipientInput>) -> Result<Campaign> {
        let mut campaign = self.load(campaign_id)?;
        Self::expect_status(
            &campaign,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            "attach recipients to",
        )?;

        let recipients: Vec<CampaignRecipient> = inputs
            .into_iter()
            .map(|input| {
                let recipient = CampaignRecipient::new(campaign_id, input.phone_number, input.name);
                match input.variables {
                    Some(variables) => recipient.with_variables(variables),
                    None => recipient,
                }
            })
            .collect();

        let mut store = lock(&self.store)?;
        store.insert_recipients(&recipients)?;
        campaign.apply_counts(&store.count_recipients(campaign_id)?);
        store.save_campaign(&campaign)?;
        info!(campaign_id = %campaign_id, "Attached {} recipients", recipients.len());
        Ok(campaign)
    }

    /// Drop every recipient of a campaign that is not running
    pub fn clear_recipients(&self, campaign_id: &str) -> Result<usize> {
        let mut campaign = self.load(campaign_id)?;
        if campaign.status == CampaignStatus::Running {
            return Err(CampaignError::InvalidTransition {
                campaign_id: campaign.id,
                status: campaign.status,
                action: "clear recipients of",
            });
        }

        let store = lock(&self.store)?;
        let removed = store.delete_recipients(campaign_id)?;
        campaign.apply_counts(&store.count_recipients(campaign_id)?);
        store.save_campaign(&campaign)?;
        Ok(removed)
    }

    /// Plan a start time; the scheduler picks the campaign up once due
    pub fn schedule(&self, campaign_id: &str, at: DateTime<Utc>) -> Result<Campaign> {
        let mut campaign = self.load(campaign_id)?;
        Self::expect_status(
            &campaign,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            "schedule",
        )?;
        campaign.status = CampaignStatus::Scheduled;
        campaign.scheduled_at = Some(at);
        self.save(&campaign)?;
        info!(campaign_id = %campaign_id, "Campaign scheduled for {}", at);
        Ok(campaign)
    }

    /// Move a draft or scheduled campaign to `running` without dispatching
    pub fn begin(&self, campaign_id: &str) -> Result<Campaign> {
        let mut campaign = self.load(campaign_id)?;
        Self::expect_status(
            &campaign,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            "start",
        )?;

        let pending = lock(&self.store)?.count_recipients(campaign_id)?.pending;
        if pending == 0 {
            return Err(CampaignError::NoPendingRecipients(campaign_id.to_string()));
        }

        campaign.status = CampaignStatus::Running;
        campaign.started_at = Some(Utc::now());
        self.save(&campaign)?;
        info!(campaign_id = %campaign_id, "Campaign started with {} pending recipients", pending);
        Ok(campaign)
    }

    /// Start a draft or scheduled campaign and run its first pass
    pub async fn start(&self, campaign_id: &str) -> Result<PassReport> {
        self.begin(campaign_id)?;
        self.run_pass(campaign_id).await
    }

    /// Stop initiating sends; recipients are left untouched
    pub fn pause(&self, campaign_id: &str) -> Result<Campaign> {
        let mut campaign = self.load(campaign_id)?;
        Self::expect_status(&campaign, &[CampaignStatus::Running], "pause")?;
        campaign.status = CampaignStatus::Paused;
        self.save(&campaign)?;
        info!(campaign_id = %campaign_id, "Campaign paused");
        Ok(campaign)
    }

    /// `paused → running` without dispatching
    pub fn unpause(&self, campaign_id: &str) -> Result<Campaign> {
        let mut campaign = self.load(campaign_id)?;
        Self::expect_status(&campaign, &[CampaignStatus::Paused], "resume")?;
        campaign.status = CampaignStatus::Running;
        self.save(&campaign)?;
        info!(campaign_id = %campaign_id, "Campaign resumed");
        Ok(campaign)
    }

    pub async fn resume(&self, campaign_id: &str) -> Result<PassReport> {
        self.unpause(campaign_id)?;
        self.run_pass(campaign_id).await
    }

    /// Requeue failed recipients that still have retries left, returning
    /// how many went back to pending
    pub fn requeue_failed(&self, campaign_id: &str) -> Result<usize> {
        let campaign = self.load(campaign_id)?;
        Self::expect_status(
            &campaign,
            &[CampaignStatus::Running, CampaignStatus::Completed],
            "retry",
        )?;
        let requeued = self.requeue(&campaign, |_| true)?;
        info!(campaign_id = %campaign_id, "Requeued {} failed recipients", requeued);
        Ok(requeued)
    }

    /// Requeue failed recipients and dispatch them right away
    pub async fn retry_failed(&self, campaign_id: &str) -> Result<PassReport> {
        self.requeue_failed(campaign_id)?;
        self.run_pass(campaign_id).await
    }

    /// Automatic retry of failed recipients whose retry delay has elapsed.
    /// Returns `None` when the campaign has nothing eligible.
    pub async fn run_auto_retries(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PassReport>> {
        let campaign = self.load(campaign_id)?;
        if !campaign.auto_retry_enabled
            || !matches!(
                campaign.status,
                CampaignStatus::Running | CampaignStatus::Completed
            )
        {
            return Ok(None);
        }

        let delay = chrono::Duration::minutes(i64::from(campaign.retry_delay_minutes));
        let requeued = self.requeue(&campaign, |r| {
            r.last_attempt_at.is_none_or(|at| now - at >= delay)
        })?;
        if requeued == 0 {
            return Ok(None);
        }

        info!(campaign_id = %campaign_id, "Auto-retrying {} recipients", requeued);
        self.run_pass(campaign_id).await.map(Some)
    }

    /// Put eligible failed recipients back to pending and the campaign back
    /// to running. Blacklisted recipients are never requeued.
    fn requeue<F>(&self, campaign: &Campaign, due: F) -> Result<usize>
    where
        F: Fn(&CampaignRecipient) -> bool,
    {
        let store = lock(&self.store)?;
        let failed = store.list_recipients_by_status(&campaign.id, RecipientStatus::Failed)?;

        let mut requeued = 0;
        for mut recipient in failed {
            if recipient.retry_count >= campaign.max_retries
                || recipient.error_message.as_deref() == Some(BLACKLISTED_ERROR)
                || !due(&recipient)
            {
                continue;
            }
            recipient.status = RecipientStatus::Pending;
            recipient.retry_count += 1;
            recipient.error_message = None;
            store.update_recipient(&recipient)?;
            requeued += 1;
        }

        if requeued > 0 && campaign.status != CampaignStatus::Running {
            let mut campaign = campaign.clone();
            campaign.status = CampaignStatus::Running;
            campaign.completed_at = None;
            store.save_campaign(&campaign)?;
        }
        Ok(requeued)
    }

    /// One sequential sweep over the pending recipients of a running campaign
    pub async fn run_pass(&self, campaign_id: &str) -> Result<PassReport> {
        let Some(_guard) = self.begin_pass(campaign_id) else {
            debug!(campaign_id = %campaign_id, "Pass already in progress, skipping");
            return Ok(PassReport {
                campaign: self.load(campaign_id)?,
                sent: 0,
                failed: 0,
                blocked: 0,
                interrupted: true,
            });
        };

        let campaign = self.load(campaign_id)?;
        let mut report = PassReport {
            campaign: campaign.clone(),
            sent: 0,
            failed: 0,
            blocked: 0,
            interrupted: false,
        };
        if campaign.status != CampaignStatus::Running {
            report.interrupted = true;
            return Ok(report);
        }

        let (account, template, pending, blocked) = {
            let store = lock(&self.store)?;
            let account = store
                .get_account(&campaign.business_account_id)?
                .ok_or_else(|| CampaignError::AccountNotFound(campaign.business_account_id.clone()))?;
            let template = store.get_template(
                &campaign.business_account_id,
                &campaign.template_name,
                &campaign.template_language,
            )?;
            let pending = store.list_recipients_by_status(campaign_id, RecipientStatus::Pending)?;
            let numbers: Vec<String> = pending.iter().map(|r| r.phone_number.clone()).collect();
            let outcome = store.filter_allowed(&campaign.business_account_id, &numbers)?;
            let blocked: HashSet<String> = outcome.blocked.into_iter().collect();
            (account, template, pending, blocked)
        };

        let (rejected, allowed): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|r| blocked.contains(&r.phone_number));

        if !rejected.is_empty() {
            let now = Utc::now();
            let store = lock(&self.store)?;
            for mut recipient in rejected {
                recipient.mark_failed(BLACKLISTED_ERROR, now);
                store.update_recipient(&recipient)?;
                report.blocked += 1;
            }
            info!(campaign_id = %campaign_id, "Skipped {} blacklisted recipients", report.blocked);
        }

        let total = allowed.len();
        for (index, mut recipient) in allowed.into_iter().enumerate() {
            if self.load(campaign_id)?.status != CampaignStatus::Running {
                info!(campaign_id = %campaign_id, "Campaign no longer running, stopping pass");
                report.interrupted = true;
                break;
            }

            let message = self.message_for(&campaign, template.as_ref(), &recipient);
            match self.send(&account, &recipient.phone_number, &message).await {
                Ok(message_id) => {
                    recipient.mark_sent(message_id, Utc::now());
                    report.sent += 1;
                }
                Err(error) => {
                    warn!(
                        campaign_id = %campaign_id,
                        "Send to {} failed: {}",
                        recipient.phone_number,
                        error
                    );
                    recipient.mark_failed(error, Utc::now());
                    report.failed += 1;
                }
            }
            lock(&self.store)?.update_recipient(&recipient)?;

            if index + 1 < total {
                tokio::time::sleep(self.pacing.delay_after(index + 1)).await;
            }
        }

        report.campaign = self.finish_pass(campaign_id)?;
        info!(
            campaign_id = %campaign_id,
            "Pass finished: {} sent, {} failed, {} blocked ({})",
            report.sent,
            report.failed,
            report.blocked,
            report.campaign.status
        );
        Ok(report)
    }

    fn begin_pass(&self, campaign_id: &str) -> Option<PassGuard<'_>> {
        let mut active = self.active.lock().ok()?;
        if !active.insert(campaign_id.to_string()) {
            return None;
        }
        Some(PassGuard {
            active: &self.active,
            campaign_id: campaign_id.to_string(),
        })
    }

    fn message_for(
        &self,
        campaign: &Campaign,
        template: Option<&MessageTemplate>,
        recipient: &CampaignRecipient,
    ) -> TemplateMessage {
        let resolved = resolve_variables(&campaign.template_variables, recipient);
        TemplateMessage {
            name: campaign.template_name.clone(),
            language: campaign.template_language.clone(),
            parameters: build_parameters(&resolved, template),
        }
    }

    async fn send(
        &self,
        account: &BusinessAccount,
        to: &str,
        message: &TemplateMessage,
    ) -> std::result::Result<String, String> {
        match tokio::time::timeout(
            self.send_timeout,
            self.sender.send_template(account, to, message),
        )
        .await
        {
            Ok(Ok(message_id)) => Ok(message_id),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "send timed out after {}s",
                self.send_timeout.as_secs()
            )),
        }
    }

    /// Recount from the full recipient set and complete when nothing is pending
    fn finish_pass(&self, campaign_id: &str) -> Result<Campaign> {
        let store = lock(&self.store)?;
        let mut campaign = store
            .get_campaign(campaign_id)?
            .ok_or_else(|| CampaignError::NotFound(campaign_id.to_string()))?;
        let counts = store.count_recipients(campaign_id)?;
        campaign.apply_counts(&counts);
        if campaign.status == CampaignStatus::Running && counts.pending == 0 {
            campaign.status = CampaignStatus::Completed;
            campaign.completed_at = Some(Utc::now());
        }
        store.save_campaign(&campaign)?;
        Ok(campaign)
    }

    /// Apply a provider delivery status to the recipient that owns the
    /// message id. Returns false when the id is unknown or the update would
    /// move the recipient backwards.
    pub fn apply_status_update(
        &self,
        provider_message_id: &str,
        status: RecipientStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let store = lock(&self.store)?;
        let Some(mut recipient) = store.find_recipient_by_message_id(provider_message_id)? else {
            debug!("Status for unknown message {}", provider_message_id);
            return Ok(false);
        };

        let current = recipient.status.delivery_rank();
        let accepted = match status {
            RecipientStatus::Failed => current <= RecipientStatus::Sent.delivery_rank(),
            RecipientStatus::Pending => false,
            other => other.delivery_rank() > current,
        };
        if !accepted {
            debug!(
                "Ignoring {} for message {} (currently {})",
                status, provider_message_id, recipient.status
            );
            return Ok(false);
        }

        if status == RecipientStatus::Failed {
            recipient.mark_failed(error.unwrap_or_else(|| "delivery failed".to_string()), at);
        } else {
            recipient.status = status;
        }
        store.update_recipient(&recipient)?;

        if let Some(mut campaign) = store.get_campaign(&recipient.campaign_id)? {
            campaign.apply_counts(&store.count_recipients(&campaign.id)?);
            store.save_campaign(&campaign)?;
        }
        Ok(true)
    }
}
