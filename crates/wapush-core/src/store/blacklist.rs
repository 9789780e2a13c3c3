//! Blacklist persistence

use std::collections::HashSet;

use rusqlite::params;

use super::Store;
use crate::blacklist::normalize_phone;
use crate::models::BlacklistEntry;
use crate::Result;

impl Store {
    /// Add a blacklist entry. Returns `false` when the number was already listed.
    pub fn add_blacklist(&self, entry: &BlacklistEntry) -> Result<bool> {
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO blacklist (business_account_id, phone_number, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.business_account_id,
                normalize_phone(&entry.phone_number),
                entry.reason.as_str(),
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn remove_blacklist(&self, account_id: &str, phone_number: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM blacklist WHERE business_account_id = ?1 AND phone_number = ?2",
            params![account_id, normalize_phone(phone_number)],
        )?;
        Ok(affected > 0)
    }

    /// Normalized numbers of an account's blacklist
    pub fn blacklisted_numbers(&self, account_id: &str) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT phone_number FROM blacklist WHERE business_account_id = ?1")?;
        let rows = stmt.query_map(params![account_id], |row| row.get::<_, String>(0))?;

        let mut result = HashSet::new();
        for row in rows {
            result.insert(row?);
        }
        Ok(result)
    }
}
