use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{http_client, parse_base_url, PlatformSender};
use crate::config::Config;
use crate::model::{DeliveryOutcome, OutboundMessage, RecipientPass, WalletPlatform};

/// The Google Wallet "add message" call. With `notify` set, the same call
/// updates the card and raises a user-visible notification.
#[async_trait]
pub trait GoogleWalletApi: Send + Sync {
    async fn add_message(&self, object_id: &str, header: &str, body: &str, notify: bool) -> Result<()>;
}

#[derive(Clone)]
pub struct GoogleWalletHttp {
    http: Client,
    base_url: Url,
    access_token: String,
}

impl fmt::Debug for GoogleWalletHttp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleWalletHttp")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GoogleWalletHttp {
    pub fn new(base_url: &str, access_token: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: parse_base_url(base_url)?,
            access_token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            &cfg.google.api_base,
            cfg.google.access_token.clone(),
            cfg.app.send_timeout(),
        )
    }

    pub fn build_request(&self, object_id: &str, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("walletobjects/v1/loyaltyObject/{object_id}/addMessage"))
            .context("invalid Google Wallet base URL")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build Google Wallet request")
    }
}

#[async_trait]
impl GoogleWalletApi for GoogleWalletHttp {
    async fn add_message(&self, object_id: &str, header: &str, body: &str, notify: bool) -> Result<()> {
        let payload = build_add_message_body(header, body, notify, &Uuid::new_v4().to_string());
        let request = self.build_request(object_id, &payload)?;
        debug!(url = %request.url(), object_id, "google wallet addMessage");

        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Google Wallet")?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from Google Wallet: {}", body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("google wallet error {}: {}", status, body));
        }
        Ok(())
    }
}

pub fn build_add_message_body(header: &str, body: &str, notify: bool, message_id: &str) -> Value {
    let message_type = if notify { "TEXT_AND_NOTIFY" } else { "TEXT" };
    json!({
        "message": {
            "id": message_id,
            "header": header,
            "body": body,
            "messageType": message_type,
        }
    })
}

/// Pushes the message straight into the remote wallet object.
pub struct GoogleSender {
    wallet: Arc<dyn GoogleWalletApi>,
    issuer_id: String,
}

impl GoogleSender {
    pub fn new(wallet: Arc<dyn GoogleWalletApi>, issuer_id: String) -> Self {
        Self { wallet, issuer_id }
    }

    pub fn object_id(&self, pass_id: &str) -> String {
        format!("{}.{}", self.issuer_id, pass_id)
    }
}

#[async_trait]
impl PlatformSender for GoogleSender {
    fn platform(&self) -> WalletPlatform {
        WalletPlatform::Google
    }

    async fn notify(&self, recipient: &RecipientPass, message: &OutboundMessage) -> DeliveryOutcome {
        let object_id = self.object_id(&recipient.id);
        match self
            .wallet
            .add_message(&object_id, &message.header, &message.body, true)
            .await
        {
            Ok(()) => DeliveryOutcome::delivered(&recipient.id),
            Err(err) => {
                warn!(recipient = %recipient.id, object_id = %object_id, ?err, "google wallet message failed");
                DeliveryOutcome::failed(&recipient.id, format!("{err:#}"))
            }
        }
    }
}
