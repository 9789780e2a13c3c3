//! SQLite persistence for sessions, campaigns, recipients and the blacklist

mod accounts;
mod blacklist;
mod campaigns;
mod sessions;

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::{Error, Result};

/// Store shared between tasks
pub type SharedStore = Arc<Mutex<Store>>;

/// SQLite-based store
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path
    pub fn new(db_path: &str) -> Result<Self> {
        debug!("Opening database at: {}", db_path);
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        let store = Self { conn };
        store.init_tables()?;
        info!("Store initialized successfully");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_tables()?;
        Ok(store)
    }

    /// Wrap the store for sharing across tasks
    pub fn shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    fn init_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                phone_number TEXT,
                last_connected_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_webhooks (
                session_id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                secret TEXT
            );

            CREATE TABLE IF NOT EXISTS business_accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                phone_number_id TEXT NOT NULL UNIQUE,
                access_token TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_templates (
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                language TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (account_id, name, language)
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                business_account_id TEXT NOT NULL,
                template_name TEXT NOT NULL,
                template_language TEXT NOT NULL,
                template_variables TEXT NOT NULL,
                status TEXT NOT NULL,
                total_recipients INTEGER NOT NULL DEFAULT 0,
                sent_count INTEGER NOT NULL DEFAULT 0,
                delivered_count INTEGER NOT NULL DEFAULT 0,
                read_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                scheduled_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                auto_retry_enabled INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_delay_minutes INTEGER NOT NULL DEFAULT 30,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);

            CREATE TABLE IF NOT EXISTS campaign_recipients (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL,
                phone_number TEXT NOT NULL,
                name TEXT,
                variables TEXT,
                status TEXT NOT NULL,
                provider_message_id TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT,
                last_attempt_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_recipients_campaign ON campaign_recipients(campaign_id);
            CREATE INDEX IF NOT EXISTS idx_recipients_message ON campaign_recipients(provider_message_id);

            CREATE TABLE IF NOT EXISTS blacklist (
                business_account_id TEXT NOT NULL,
                phone_number TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (business_account_id, phone_number)
            );",
        )?;
        Ok(())
    }
}

/// Lock a shared store, mapping poisoning to a store error
pub fn lock(store: &SharedStore) -> Result<MutexGuard<'_, Store>> {
    store.lock().map_err(|_| Error::LockPoisoned)
}

fn to_sql_time(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339())
}

fn parse_time(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
        })
        .transpose()
}

fn parse_required_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_time(idx, Some(value)).map(|t| t.unwrap_or_else(Utc::now))
}

fn parse_enum<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    value
        .parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, value: String) -> rusqlite::Result<T> {
    serde_json::from_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_creation() {
        let store = Store::in_memory().unwrap();
        assert!(store.get_session("missing").unwrap().is_none());
    }

    #[test]
    fn test_file_store_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wapush.db");
        let store = Store::new(path.to_str().unwrap()).unwrap();
        assert!(store.get_session("x").unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_shared_lock() {
        let shared = Store::in_memory().unwrap().shared();
        let guard = lock(&shared).unwrap();
        assert!(guard.get_account("none").unwrap().is_none());
    }
}
