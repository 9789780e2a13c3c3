//! Campaign and recipient persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_enum, parse_json, parse_required_time, parse_time, to_sql_time, Store};
use crate::models::{Campaign, CampaignCounts, CampaignRecipient, CampaignStatus, RecipientStatus};
use crate::Result;

const CAMPAIGN_COLUMNS: &str = "id, business_account_id, template_name, template_language,
    template_variables, status, total_recipients, sent_count, delivered_count, read_count,
    failed_count, scheduled_at, started_at, completed_at, auto_retry_enabled, max_retries,
    retry_delay_minutes, created_at";

const RECIPIENT_COLUMNS: &str = "id, campaign_id, phone_number, name, variables, status,
    provider_message_id, error_message, retry_count, sent_at, last_attempt_at";

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    Ok(Campaign {
        id: row.get(0)?,
        business_account_id: row.get(1)?,
        template_name: row.get(2)?,
        template_language: row.get(3)?,
        template_variables: parse_json(4, row.get(4)?)?,
        status: parse_enum(5, row.get(5)?)?,
        total_recipients: row.get(6)?,
        sent_count: row.get(7)?,
        delivered_count: row.get(8)?,
        read_count: row.get(9)?,
        failed_count: row.get(10)?,
        scheduled_at: parse_time(11, row.get(11)?)?,
        started_at: parse_time(12, row.get(12)?)?,
        completed_at: parse_time(13, row.get(13)?)?,
        auto_retry_enabled: row.get(14)?,
        max_retries: row.get(15)?,
        retry_delay_minutes: row.get(16)?,
        created_at: parse_required_time(17, row.get(17)?)?,
    })
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<CampaignRecipient> {
    let variables: Option<String> = row.get(4)?;
    Ok(CampaignRecipient {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        phone_number: row.get(2)?,
        name: row.get(3)?,
        variables: variables.map(|v| parse_json(4, v)).transpose()?,
        status: parse_enum(5, row.get(5)?)?,
        provider_message_id: row.get(6)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
        sent_at: parse_time(9, row.get(9)?)?,
        last_attempt_at: parse_time(10, row.get(10)?)?,
    })
}

impl Store {
    /// Insert or fully overwrite a campaign row
    pub fn save_campaign(&self, campaign: &Campaign) -> Result<()> {
        let variables = serde_json::to_string(&campaign.template_variables)?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO campaigns ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                CAMPAIGN_COLUMNS
            ),
            params![
                campaign.id,
                campaign.business_account_id,
                campaign.template_name,
                campaign.template_language,
                variables,
                campaign.status.as_str(),
                campaign.total_recipients,
                campaign.sent_count,
                campaign.delivered_count,
                campaign.read_count,
                campaign.failed_count,
                to_sql_time(&campaign.scheduled_at),
                to_sql_time(&campaign.started_at),
                to_sql_time(&campaign.completed_at),
                campaign.auto_retry_enabled,
                campaign.max_retries,
                campaign.retry_delay_minutes,
                campaign.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let campaign = self
            .conn
            .query_row(
                &format!("SELECT {} FROM campaigns WHERE id = ?1", CAMPAIGN_COLUMNS),
                params![id],
                campaign_from_row,
            )
            .optional()?;
        Ok(campaign)
    }

    pub fn list_campaigns_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM campaigns WHERE status = ?1 ORDER BY created_at",
            CAMPAIGN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], campaign_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Scheduled campaigns whose start time has elapsed
    pub fn list_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let campaigns = self.list_campaigns_by_status(CampaignStatus::Scheduled)?;
        Ok(campaigns
            .into_iter()
            .filter(|c| c.scheduled_at.is_some_and(|at| at <= now))
            .collect())
    }

    /// Attach recipients to a campaign, preserving list order
    pub fn insert_recipients(&mut self, recipients: &[CampaignRecipient]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO campaign_recipients ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                RECIPIENT_COLUMNS
            ))?;
            for recipient in recipients {
                let variables = recipient
                    .variables
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    recipient.id,
                    recipient.campaign_id,
                    recipient.phone_number,
                    recipient.name,
                    variables,
                    recipient.status.as_str(),
                    recipient.provider_message_id,
                    recipient.error_message,
                    recipient.retry_count,
                    to_sql_time(&recipient.sent_at),
                    to_sql_time(&recipient.last_attempt_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Write back the mutable fields of a recipient
    pub fn update_recipient(&self, recipient: &CampaignRecipient) -> Result<()> {
        self.conn.execute(
            "UPDATE campaign_recipients SET
                status = ?2, provider_message_id = ?3, error_message = ?4,
                retry_count = ?5, sent_at = ?6, last_attempt_at = ?7
             WHERE id = ?1",
            params![
                recipient.id,
                recipient.status.as_str(),
                recipient.provider_message_id,
                recipient.error_message,
                recipient.retry_count,
                to_sql_time(&recipient.sent_at),
                to_sql_time(&recipient.last_attempt_at),
            ],
        )?;
        Ok(())
    }

    /// All recipients of a campaign in attachment order
    pub fn list_recipients(&self, campaign_id: &str) -> Result<Vec<CampaignRecipient>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM campaign_recipients WHERE campaign_id = ?1 ORDER BY rowid",
            RECIPIENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![campaign_id], recipient_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn list_recipients_by_status(
        &self,
        campaign_id: &str,
        status: RecipientStatus,
    ) -> Result<Vec<CampaignRecipient>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM campaign_recipients
             WHERE campaign_id = ?1 AND status = ?2 ORDER BY rowid",
            RECIPIENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![campaign_id, status.as_str()], recipient_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn find_recipient_by_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<CampaignRecipient>> {
        let recipient = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM campaign_recipients WHERE provider_message_id = ?1",
                    RECIPIENT_COLUMNS
                ),
                params![provider_message_id],
                recipient_from_row,
            )
            .optional()?;
        Ok(recipient)
    }

    pub fn delete_recipients(&self, campaign_id: &str) -> Result<usize> {
        let affected = self.conn.execute(
            "DELETE FROM campaign_recipients WHERE campaign_id = ?1",
            params![campaign_id],
        )?;
        Ok(affected)
    }

    /// Recompute aggregates from the full recipient set
    pub fn count_recipients(&self, campaign_id: &str) -> Result<CampaignCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status FROM campaign_recipients WHERE campaign_id = ?1")?;
        let rows = stmt.query_map(params![campaign_id], |row| {
            parse_enum::<RecipientStatus>(0, row.get(0)?)
        })?;

        let mut statuses = Vec::new();
        for row in rows {
            statuses.push(row?);
        }
        Ok(CampaignCounts::tally(statuses.iter()))
    }
}
