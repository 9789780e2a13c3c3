//! エラー型定義 (wapush-schedule)

use thiserror::Error;

/// wapush-schedule のエラー型
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Core error: {0}")]
    Core(#[from] wapush_core::Error),

    #[error("Campaign error: {0}")]
    Campaign(#[from] wapush_campaign::CampaignError),
}

/// Result 型エイリアス
pub type Result<T> = std::result::Result<T, ScheduleError>;
