//! Session status mirror and per-session webhook configuration

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{parse_time, to_sql_time, Store};
use crate::models::{SessionRecord, SessionWebhook};
use crate::Result;

impl Store {
    /// Mirror a session's connection status for display
    pub fn upsert_session_status(
        &self,
        id: &str,
        status: &str,
        phone_number: Option<&str>,
        last_connected_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (id, status, phone_number, last_connected_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                phone_number = COALESCE(excluded.phone_number, sessions.phone_number),
                last_connected_at = COALESCE(excluded.last_connected_at, sessions.last_connected_at),
                updated_at = excluded.updated_at",
            params![
                id,
                status,
                phone_number,
                to_sql_time(&last_connected_at),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load the mirrored session record
    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, status, phone_number, last_connected_at FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        status: row.get(1)?,
                        phone_number: row.get(2)?,
                        last_connected_at: parse_time(3, row.get(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Create or replace the forwarding webhook of a session
    pub fn set_session_webhook(&self, webhook: &SessionWebhook) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO session_webhooks (session_id, url, secret) VALUES (?1, ?2, ?3)",
            params![webhook.session_id, webhook.url, webhook.secret],
        )?;
        Ok(())
    }

    pub fn get_session_webhook(&self, session_id: &str) -> Result<Option<SessionWebhook>> {
        let webhook = self
            .conn
            .query_row(
                "SELECT session_id, url, secret FROM session_webhooks WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionWebhook {
                        session_id: row.get(0)?,
                        url: row.get(1)?,
                        secret: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(webhook)
    }

    /// All configured session webhooks, used to rebuild the forwarder cache
    pub fn list_session_webhooks(&self) -> Result<Vec<SessionWebhook>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id, url, secret FROM session_webhooks")?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionWebhook {
                session_id: row.get(0)?,
                url: row.get(1)?,
                secret: row.get(2)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_session_webhook(&self, session_id: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM session_webhooks WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(affected > 0)
    }
}
