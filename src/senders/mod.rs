//! Platform delivery primitives behind one interface.
//!
//! The dispatcher only sees [`PlatformSender`]; each implementation absorbs its
//! own errors into a [`DeliveryOutcome`] so one recipient can never fail a batch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;

use crate::model::{DeliveryOutcome, OutboundMessage, RecipientPass, WalletPlatform};

pub mod apple;
pub mod google;

pub use apple::{AppleSender, ApnsWakeUp, WakeReport, WakeUpChannel};
pub use google::{GoogleSender, GoogleWalletApi, GoogleWalletHttp};

const USER_AGENT: &str = "wallet-push/0.1";

#[async_trait]
pub trait PlatformSender: Send + Sync {
    fn platform(&self) -> WalletPlatform;

    async fn notify(&self, recipient: &RecipientPass, message: &OutboundMessage) -> DeliveryOutcome;
}

/// Parse a configured API base so that `Url::join` appends rather than
/// replaces the last path segment.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).with_context(|| format!("invalid base url {raw}"))
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let url = parse_base_url("https://example.test/api").unwrap();
        assert_eq!(url.join("v1/x").unwrap().as_str(), "https://example.test/api/v1/x");
        assert!(parse_base_url("not a url").is_err());
    }
}
