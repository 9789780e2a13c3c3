//! キャンペーンスケジューラー
//!
//! 予約済みキャンペーンの開始と自動リトライを一定間隔で実行します。

mod error;
mod scheduler;

pub use error::{Result, ScheduleError};
pub use scheduler::{CampaignScheduler, SchedulerHandle, TickReport};
