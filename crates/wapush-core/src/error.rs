//! Error types for wapush-core

use thiserror::Error;

/// Main error type for wapush-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Result type alias for wapush-core
pub type Result<T> = std::result::Result<T, Error>;
