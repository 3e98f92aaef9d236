#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use wallet_push::config::Dispatch;
use wallet_push::db::{self, Pool};
use wallet_push::dispatch::BatchDispatcher;
use wallet_push::lifecycle::{AudienceThreshold, PushLifecycle};
use wallet_push::model::{DeliveryOutcome, OutboundMessage, RecipientPass, WalletPlatform};
use wallet_push::senders::{GoogleWalletApi, PlatformSender, WakeReport, WakeUpChannel};

pub async fn setup_pool() -> (TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/wallet_push.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (dir, pool)
}

pub async fn seed_campaign(pool: &Pool, business_name: &str) -> i64 {
    let client_id: i64 =
        sqlx::query_scalar("INSERT INTO clients (business_name) VALUES (?) RETURNING id")
            .bind(business_name)
            .fetch_one(pool)
            .await
            .unwrap();
    sqlx::query_scalar("INSERT INTO campaigns (client_id, name) VALUES (?, 'Loyalty') RETURNING id")
        .bind(client_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn seed_pass(
    pool: &Pool,
    campaign_id: i64,
    id: &str,
    platform: Option<&str>,
    verified: bool,
    installed_on_ios: bool,
    installed_on_android: bool,
) {
    sqlx::query(
        "INSERT INTO passes (id, campaign_id, platform, verified, installed_on_ios, installed_on_android) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(campaign_id)
    .bind(platform)
    .bind(verified)
    .bind(installed_on_ios)
    .bind(installed_on_android)
    .execute(pool)
    .await
    .unwrap();
}

/// `apple` verified Apple passes named `a0..` and `google` verified Google
/// passes named `g0..`.
pub async fn seed_audience(pool: &Pool, campaign_id: i64, apple: usize, google: usize) {
    for i in 0..apple {
        seed_pass(pool, campaign_id, &format!("a{i}"), Some("apple"), true, true, false).await;
    }
    for i in 0..google {
        seed_pass(pool, campaign_id, &format!("g{i}"), Some("google"), true, false, true).await;
    }
}

#[derive(Clone)]
pub struct RecordingSender {
    platform: WalletPlatform,
    failing: Arc<HashSet<String>>,
    calls: Arc<Mutex<Vec<(String, OutboundMessage)>>>,
}

impl RecordingSender {
    pub fn new(platform: WalletPlatform, failing: &[&str]) -> Self {
        Self {
            platform,
            failing: Arc::new(failing.iter().map(|s| s.to_string()).collect()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn calls(&self) -> Vec<(String, OutboundMessage)> {
        self.calls.lock().await.clone()
    }

    pub async fn recipients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.calls().await.into_iter().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl PlatformSender for RecordingSender {
    fn platform(&self) -> WalletPlatform {
        self.platform
    }

    async fn notify(&self, recipient: &RecipientPass, message: &OutboundMessage) -> DeliveryOutcome {
        self.calls
            .lock()
            .await
            .push((recipient.id.clone(), message.clone()));
        if self.failing.contains(&recipient.id) {
            DeliveryOutcome::failed(&recipient.id, format!("{} rejected", recipient.id))
        } else {
            DeliveryOutcome::delivered(&recipient.id)
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingWakeUp {
    pub woken: Arc<Mutex<Vec<String>>>,
    pub hard_fail: bool,
}

#[async_trait]
impl WakeUpChannel for RecordingWakeUp {
    async fn wake(&self, pass_id: &str) -> Result<WakeReport> {
        self.woken.lock().await.push(pass_id.to_string());
        if self.hard_fail {
            return Err(anyhow!("APNs unreachable"));
        }
        Ok(WakeReport {
            attempted: 2,
            failed: 1,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletCall {
    pub object_id: String,
    pub header: String,
    pub body: String,
    pub notify: bool,
}

#[derive(Clone, Default)]
pub struct RecordingWallet {
    pub calls: Arc<Mutex<Vec<WalletCall>>>,
}

#[async_trait]
impl GoogleWalletApi for RecordingWallet {
    async fn add_message(&self, object_id: &str, header: &str, body: &str, notify: bool) -> Result<()> {
        self.calls.lock().await.push(WalletCall {
            object_id: object_id.to_string(),
            header: header.to_string(),
            body: body.to_string(),
            notify,
        });
        Ok(())
    }
}

pub fn lifecycle_with(
    pool: &Pool,
    apple: Arc<dyn PlatformSender>,
    google: Arc<dyn PlatformSender>,
    queue_threshold: i64,
) -> Arc<PushLifecycle> {
    let dispatcher = BatchDispatcher::new(Dispatch::default(), Duration::from_secs(5));
    let sizing = Arc::new(AudienceThreshold::new(pool.clone(), queue_threshold));
    Arc::new(PushLifecycle::new(pool.clone(), dispatcher, apple, google, sizing))
}

pub fn recording_lifecycle(
    pool: &Pool,
    apple_failing: &[&str],
    google_failing: &[&str],
) -> (Arc<PushLifecycle>, RecordingSender, RecordingSender) {
    let apple = RecordingSender::new(WalletPlatform::Apple, apple_failing);
    let google = RecordingSender::new(WalletPlatform::Google, google_failing);
    let lifecycle = lifecycle_with(pool, Arc::new(apple.clone()), Arc::new(google.clone()), 1_000);
    (lifecycle, apple, google)
}
