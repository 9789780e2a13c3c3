//! Blacklist filtering and opt-out keyword detection

use serde::Serialize;

use crate::models::BlacklistReason;
use crate::store::Store;
use crate::Result;

/// Opt-out phrases matched against the whole normalized message
const OPT_OUT_KEYWORDS: &[&str] = &[
    "stop",
    "stop all",
    "unsubscribe",
    "cancel",
    "end",
    "quit",
    "opt out",
    "optout",
    "opt-out",
    "remove me",
    "parar",
    "pare",
    "sair",
    "cancelar",
    "descadastrar",
    "remover",
    "baja",
    "alto",
];

/// Phrases that report the sender as spam rather than a plain opt-out
const SPAM_KEYWORDS: &[&str] = &["spam", "report spam", "denunciar", "reportar spam"];

/// Reduce a phone number to its digits
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Partition of a number list by blacklist membership
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterOutcome {
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
}

impl Store {
    /// Partition numbers by the account's blacklist.
    ///
    /// Input order is kept in both halves and the original spelling of each
    /// number is returned; membership is tested on the digits only.
    pub fn filter_allowed(&self, account_id: &str, phone_numbers: &[String]) -> Result<FilterOutcome> {
        let listed = self.blacklisted_numbers(account_id)?;
        let mut outcome = FilterOutcome::default();
        for phone in phone_numbers {
            if listed.contains(&normalize_phone(phone)) {
                outcome.blocked.push(phone.clone());
            } else {
                outcome.allowed.push(phone.clone());
            }
        }
        Ok(outcome)
    }
}

/// Result of scanning an inbound message for opt-out intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OptOutDetection {
    pub is_opt_out: bool,
    pub reason: Option<BlacklistReason>,
}

impl OptOutDetection {
    fn none() -> Self {
        Self {
            is_opt_out: false,
            reason: None,
        }
    }

    fn matched(reason: BlacklistReason) -> Self {
        Self {
            is_opt_out: true,
            reason: Some(reason),
        }
    }
}

/// Match trimmed, case-insensitive text against the opt-out keyword set
pub fn detect_opt_out(text: &str) -> OptOutDetection {
    let normalized = text
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim()
        .to_lowercase();
    if normalized.is_empty() {
        return OptOutDetection::none();
    }

    if SPAM_KEYWORDS.contains(&normalized.as_str()) {
        return OptOutDetection::matched(BlacklistReason::SpamReport);
    }
    if OPT_OUT_KEYWORDS.contains(&normalized.as_str()) {
        return OptOutDetection::matched(BlacklistReason::OptOutKeyword);
    }
    OptOutDetection::none()
}
