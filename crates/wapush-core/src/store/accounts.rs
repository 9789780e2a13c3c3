//! Business accounts and message templates

use rusqlite::{params, OptionalExtension, Row};

use super::Store;
use crate::models::{BusinessAccount, MessageTemplate};
use crate::Result;

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<BusinessAccount> {
    Ok(BusinessAccount {
        id: row.get(0)?,
        name: row.get(1)?,
        phone_number_id: row.get(2)?,
        access_token: row.get(3)?,
    })
}

impl Store {
    pub fn upsert_account(&self, account: &BusinessAccount) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO business_accounts (id, name, phone_number_id, access_token)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                account.id,
                account.name,
                account.phone_number_id,
                account.access_token
            ],
        )?;
        Ok(())
    }

    pub fn get_account(&self, id: &str) -> Result<Option<BusinessAccount>> {
        let account = self
            .conn
            .query_row(
                "SELECT id, name, phone_number_id, access_token FROM business_accounts WHERE id = ?1",
                params![id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// Resolve the account owning a Cloud API phone number id
    pub fn get_account_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<BusinessAccount>> {
        let account = self
            .conn
            .query_row(
                "SELECT id, name, phone_number_id, access_token FROM business_accounts
                 WHERE phone_number_id = ?1",
                params![phone_number_id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    pub fn upsert_template(&self, template: &MessageTemplate) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO message_templates (account_id, name, language, body)
             VALUES (?1, ?2, ?3, ?4)",
            params![template.account_id, template.name, template.language, template.body],
        )?;
        Ok(())
    }

    pub fn get_template(
        &self,
        account_id: &str,
        name: &str,
        language: &str,
    ) -> Result<Option<MessageTemplate>> {
        let template = self
            .conn
            .query_row(
                "SELECT account_id, name, language, body FROM message_templates
                 WHERE account_id = ?1 AND name = ?2 AND language = ?3",
                params![account_id, name, language],
                |row| {
                    Ok(MessageTemplate {
                        account_id: row.get(0)?,
                        name: row.get(1)?,
                        language: row.get(2)?,
                        body: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }
}
