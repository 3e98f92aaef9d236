use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{http_client, parse_base_url, PlatformSender};
use crate::config::Config;
use crate::db::{self, AppleRegistration, Pool};
use crate::model::{DeliveryOutcome, OutboundMessage, RecipientPass, WalletPlatform};

/// Per-registration tally of one wake-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WakeReport {
    pub attempted: usize,
    pub failed: usize,
}

/// Silent "re-fetch this pass" signal. No message content travels here.
///
/// `Err` means the signal could not be dispatched at all; individual device
/// failures are reported through [`WakeReport::failed`].
#[async_trait]
pub trait WakeUpChannel: Send + Sync {
    async fn wake(&self, pass_id: &str) -> Result<WakeReport>;
}

/// APNs wake-up for Wallet passes: one empty-payload push per registered device.
#[derive(Clone)]
pub struct ApnsWakeUp {
    pool: Pool,
    http: Client,
    base_url: Url,
    topic: String,
    auth_token: String,
}

impl fmt::Debug for ApnsWakeUp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApnsWakeUp")
            .field("base_url", &self.base_url)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl ApnsWakeUp {
    pub fn new(
        pool: Pool,
        base_url: &str,
        topic: String,
        auth_token: String,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            pool,
            http: http_client(timeout)?,
            base_url: parse_base_url(base_url)?,
            topic,
            auth_token,
        })
    }

    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self> {
        Self::new(
            pool,
            &cfg.apple.apns_url,
            cfg.apple.pass_type_id.clone(),
            cfg.apple.auth_token.clone(),
            cfg.app.send_timeout(),
        )
    }

    pub fn build_request(&self, push_token: &str) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("3/device/{push_token}"))
            .context("invalid APNs base URL")?;
        self.http
            .post(endpoint)
            .header("authorization", format!("bearer {}", self.auth_token))
            .header("apns-topic", &self.topic)
            .header("apns-push-type", "background")
            .header("apns-priority", "5")
            .header("content-type", "application/json")
            .body("{}")
            .build()
            .context("failed to build APNs request")
    }

    /// `Ok(false)` for a delivery APNs refused; the registration is dropped
    /// when APNs reports the token as no longer active.
    async fn push_one(&self, registration: &AppleRegistration) -> Result<bool> {
        let request = self.build_request(&registration.push_token)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach APNs")?;
        let status = res.status();
        if status.is_success() {
            return Ok(true);
        }

        let body = res.text().await.unwrap_or_default();
        warn!(
            pass_id = %registration.pass_id,
            device = %registration.device_library_id,
            %status,
            body = %body,
            "APNs rejected wake-up"
        );
        if status == StatusCode::GONE {
            db::delete_apple_registration(&self.pool, registration.id).await?;
            info!(
                pass_id = %registration.pass_id,
                device = %registration.device_library_id,
                "removed unregistered device"
            );
        }
        Ok(false)
    }
}

#[async_trait]
impl WakeUpChannel for ApnsWakeUp {
    async fn wake(&self, pass_id: &str) -> Result<WakeReport> {
        let registrations = db::list_apple_registrations(&self.pool, pass_id).await?;
        if registrations.is_empty() {
            debug!(pass_id, "no registered devices; pass refreshes on next pull");
            return Ok(WakeReport::default());
        }

        let results = join_all(registrations.iter().map(|r| self.push_one(r))).await;
        let mut report = WakeReport {
            attempted: registrations.len(),
            failed: 0,
        };
        for result in results {
            match result {
                Ok(true) => {}
                Ok(false) => report.failed += 1,
                Err(err) => {
                    warn!(pass_id, ?err, "wake-up to device failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Writes the message into the pass state, then asks devices to re-fetch.
pub struct AppleSender {
    pool: Pool,
    channel: Arc<dyn WakeUpChannel>,
}

impl AppleSender {
    pub fn new(pool: Pool, channel: Arc<dyn WakeUpChannel>) -> Self {
        Self { pool, channel }
    }
}

#[async_trait]
impl PlatformSender for AppleSender {
    fn platform(&self) -> WalletPlatform {
        WalletPlatform::Apple
    }

    async fn notify(&self, recipient: &RecipientPass, message: &OutboundMessage) -> DeliveryOutcome {
        let now = Utc::now();
        // The device re-fetches on wake-up, so the new content must be stored first.
        if let Err(err) = db::update_pass_state(&self.pool, &recipient.id, |state| {
            state.merge_message(&message.body, now)
        })
        .await
        {
            warn!(recipient = %recipient.id, ?err, "pass state write failed; wake-up skipped");
            return DeliveryOutcome::failed(&recipient.id, format!("state write failed: {err:#}"));
        }

        match self.channel.wake(&recipient.id).await {
            Ok(report) => {
                if report.failed > 0 {
                    warn!(
                        recipient = %recipient.id,
                        attempted = report.attempted,
                        failed = report.failed,
                        "some device registrations did not accept the wake-up"
                    );
                }
                DeliveryOutcome::delivered(&recipient.id)
            }
            Err(err) => {
                warn!(recipient = %recipient.id, ?err, "wake-up dispatch failed");
                DeliveryOutcome::failed(&recipient.id, format!("wake-up failed: {err:#}"))
            }
        }
    }
}
