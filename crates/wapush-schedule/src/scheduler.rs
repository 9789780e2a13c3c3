//! スケジューラー
//!
//! 一定間隔で予約済みキャンペーンを開始し、実行中キャンペーンの残りと
//! 自動リトライを処理します。キャンペーンごとに独立したタスクで実行するため、
//! 1 件の失敗が同じ tick の他のキャンペーンを止めることはありません。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use wapush_campaign::{CampaignError, DispatchEngine};
use wapush_core::store::lock;
use wapush_core::{Campaign, CampaignStatus, SchedulerConfig};

use crate::error::Result;

/// スケジューラーのハンドル
pub struct SchedulerHandle {
    /// スケジューラータスクの終了送信
    shutdown_tx: broadcast::Sender<()>,
    /// 実行中のタスクハンドル
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// スケジューラーを停止
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// 1 回の tick の集計
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub retried: usize,
    pub resumed: usize,
    /// アカウント解決に失敗して failed にしたキャンペーン
    pub marked_failed: usize,
    pub errors: usize,
}

#[derive(Debug)]
enum Outcome {
    Started,
    Retried,
    Resumed,
    MarkedFailed,
    Idle,
}

/// キャンペーンスケジューラー
pub struct CampaignScheduler {
    engine: Arc<DispatchEngine>,
    interval: Duration,
}

impl CampaignScheduler {
    pub fn new(engine: Arc<DispatchEngine>, config: &SchedulerConfig) -> Self {
        Self {
            engine,
            interval: config.interval(),
        }
    }

    /// スケジューラーを開始（最初の tick は即時）
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        let handle = tokio::spawn(async move {
            info!("スケジューラーを開始しました (間隔 {}s)", self.interval.as_secs());
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.tick(Utc::now()).await {
                            Ok(report) if report != TickReport::default() => {
                                info!("tick 完了: {:?}", report);
                            }
                            Ok(_) => debug!("tick: 処理対象なし"),
                            Err(e) => error!("tick 失敗: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("シャットダウン要求を受信");
                        break;
                    }
                }
            }

            info!("スケジューラーを停止しました");
        });

        SchedulerHandle {
            shutdown_tx,
            handle,
        }
    }

    /// 1 回分の処理: 期限の来た予約の開始、実行中キャンペーンの継続と自動リトライ
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let (due, active) = {
            let store = lock(self.engine.store())?;
            let due = store.list_due_campaigns(now)?;
            let mut active = store.list_campaigns_by_status(CampaignStatus::Running)?;
            active.extend(
                store
                    .list_campaigns_by_status(CampaignStatus::Completed)?
                    .into_iter()
                    .filter(|c| c.auto_retry_enabled),
            );
            (due, active)
        };

        let mut tasks = JoinSet::new();
        for campaign in due {
            let engine = Arc::clone(&self.engine);
            tasks.spawn(async move {
                let outcome = start_due(&engine, &campaign).await;
                (campaign.id, outcome)
            });
        }
        for campaign in active {
            let engine = Arc::clone(&self.engine);
            tasks.spawn(async move {
                let outcome = continue_campaign(&engine, &campaign, now).await;
                (campaign.id, outcome)
            });
        }

        let mut report = TickReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Outcome::Started))) => report.started += 1,
                Ok((_, Ok(Outcome::Retried))) => report.retried += 1,
                Ok((_, Ok(Outcome::Resumed))) => report.resumed += 1,
                Ok((_, Ok(Outcome::MarkedFailed))) => report.marked_failed += 1,
                Ok((_, Ok(Outcome::Idle))) => {}
                Ok((campaign_id, Err(e))) => {
                    error!(campaign_id = %campaign_id, "キャンペーン処理失敗: {}", e);
                    report.errors += 1;
                }
                Err(e) => {
                    error!("キャンペーンタスクが異常終了しました: {}", e);
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }
}

/// 予約時刻を過ぎたキャンペーンを開始
async fn start_due(engine: &DispatchEngine, campaign: &Campaign) -> Result<Outcome> {
    let account = lock(engine.store())?.get_account(&campaign.business_account_id)?;
    if account.is_none() {
        mark_failed(engine, &campaign.id, "アカウントが見つかりません")?;
        return Ok(Outcome::MarkedFailed);
    }

    info!(campaign_id = %campaign.id, "予約キャンペーンを開始");
    match engine.start(&campaign.id).await {
        Ok(_) => Ok(Outcome::Started),
        // 次の tick でも同じ結果になるため failed にして打ち切る
        Err(e @ (CampaignError::AccountNotFound(_) | CampaignError::NoPendingRecipients(_))) => {
            mark_failed(engine, &campaign.id, &e.to_string())?;
            Ok(Outcome::MarkedFailed)
        }
        Err(e) => Err(e.into()),
    }
}

/// 自動リトライ、なければ実行中キャンペーンの残りを送信
async fn continue_campaign(
    engine: &DispatchEngine,
    campaign: &Campaign,
    now: DateTime<Utc>,
) -> Result<Outcome> {
    let result = match engine.run_auto_retries(&campaign.id, now).await {
        Ok(Some(_)) => return Ok(Outcome::Retried),
        Ok(None) if campaign.status == CampaignStatus::Running => {
            engine.run_pass(&campaign.id).await.map(|_| Outcome::Resumed)
        }
        Ok(None) => return Ok(Outcome::Idle),
        Err(e) => Err(e),
    };

    match result {
        Err(e @ CampaignError::AccountNotFound(_)) => {
            mark_failed(engine, &campaign.id, &e.to_string())?;
            Ok(Outcome::MarkedFailed)
        }
        other => Ok(other?),
    }
}

/// 開始できないキャンペーンを failed にする
fn mark_failed(engine: &DispatchEngine, campaign_id: &str, reason: &str) -> Result<()> {
    let store = lock(engine.store())?;
    if let Some(mut campaign) = store.get_campaign(campaign_id)? {
        warn!(campaign_id = %campaign_id, "failed にします: {}", reason);
        campaign.status = CampaignStatus::Failed;
        campaign.completed_at = Some(Utc::now());
        store.save_campaign(&campaign)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use wapush_campaign::{RecipientInput, TemplateSender};
    use wapush_core::{BusinessAccount, CampaignConfig, SharedStore, Store};
    use wapush_whatsapp::TemplateMessage;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TemplateSender for RecordingSender {
        async fn send_template(
            &self,
            _account: &BusinessAccount,
            to: &str,
            _template: &TemplateMessage,
        ) -> wapush_whatsapp::Result<String> {
            self.sent.lock().unwrap().push(to.to_string());
            Ok(format!("wamid.{}", to))
        }
    }

    fn setup() -> (Arc<DispatchEngine>, Arc<RecordingSender>, SharedStore) {
        let store = Store::in_memory().unwrap().shared();
        lock(&store)
            .unwrap()
            .upsert_account(&BusinessAccount {
                id: "acct-1".to_string(),
                name: "Loja".to_string(),
                phone_number_id: "1098765".to_string(),
                access_token: "token".to_string(),
            })
            .unwrap();
        let sender = Arc::new(RecordingSender::default());
        let engine = Arc::new(DispatchEngine::new(
            store.clone(),
            sender.clone(),
            &CampaignConfig::default(),
        ));
        (engine, sender, store)
    }

    fn scheduled(engine: &DispatchEngine, account: &str, phone: &str, at: DateTime<Utc>) -> String {
        let campaign = engine
            .create_campaign(Campaign::new(account, "promo", "pt_BR"))
            .unwrap();
        engine
            .attach_recipients(
                &campaign.id,
                vec![RecipientInput {
                    phone_number: phone.to_string(),
                    name: None,
                    variables: None,
                }],
            )
            .unwrap();
        engine.schedule(&campaign.id, at).unwrap();
        campaign.id
    }

    fn status(store: &SharedStore, id: &str) -> Campaign {
        lock(store).unwrap().get_campaign(id).unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_starts_only_due_campaigns() {
        let (engine, sender, store) = setup();
        let now = Utc::now();
        let due = scheduled(&engine, "acct-1", "5511900000001", now - chrono::Duration::minutes(1));
        let later = scheduled(&engine, "acct-1", "5511900000002", now + chrono::Duration::hours(1));

        let scheduler = CampaignScheduler::new(Arc::clone(&engine), &SchedulerConfig::default());
        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.started, 1);

        assert_eq!(status(&store, &due).status, CampaignStatus::Completed);
        assert_eq!(status(&store, &later).status, CampaignStatus::Scheduled);
        assert_eq!(*sender.sent.lock().unwrap(), vec!["5511900000001".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_account_is_isolated() {
        let (engine, sender, store) = setup();
        let past = Utc::now() - chrono::Duration::minutes(5);
        let orphan = scheduled(&engine, "acct-gone", "5511900000001", past);
        let healthy = scheduled(&engine, "acct-1", "5511900000002", past);

        let scheduler = CampaignScheduler::new(Arc::clone(&engine), &SchedulerConfig::default());
        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.marked_failed, 1);
        assert_eq!(report.started, 1);

        let orphan = status(&store, &orphan);
        assert_eq!(orphan.status, CampaignStatus::Failed);
        assert!(orphan.completed_at.is_some());
        assert_eq!(status(&store, &healthy).status, CampaignStatus::Completed);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_campaign_without_recipients_is_failed() {
        let (engine, sender, store) = setup();
        let id = scheduled(&engine, "acct-1", "5511900000001", Utc::now() - chrono::Duration::minutes(1));
        engine.clear_recipients(&id).unwrap();

        let scheduler = CampaignScheduler::new(Arc::clone(&engine), &SchedulerConfig::default());
        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.marked_failed, 1);
        assert_eq!(report.errors, 0);

        let campaign = status(&store, &id);
        assert_eq!(campaign.status, CampaignStatus::Failed);
        assert!(campaign.completed_at.is_some());

        // No longer due, so the next tick leaves it alone
        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report, TickReport::default());
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_campaign_is_picked_up() {
        let (engine, sender, store) = setup();
        let id = scheduled(&engine, "acct-1", "5511900000001", Utc::now() + chrono::Duration::days(1));

        // Left running with a pending recipient, e.g. after a restart
        let mut campaign = status(&store, &id);
        campaign.status = CampaignStatus::Running;
        lock(&store).unwrap().save_campaign(&campaign).unwrap();

        let scheduler = CampaignScheduler::new(Arc::clone(&engine), &SchedulerConfig::default());
        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(status(&store, &id).status, CampaignStatus::Completed);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_runs_until_stopped() {
        let (engine, sender, store) = setup();
        let id = scheduled(&engine, "acct-1", "5511900000001", Utc::now() - chrono::Duration::seconds(1));

        let handle = CampaignScheduler::new(engine, &SchedulerConfig::default()).start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(status(&store, &id).status, CampaignStatus::Completed);

        tokio::time::sleep(Duration::from_secs(180)).await;
        handle.stop().await;
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }
}
