//! Bounded-width fan-out of one message over a recipient list.
//!
//! Recipients are sent in fixed-size batches: everything inside a batch runs
//! concurrently, and the next batch starts only after the whole batch settled.
//! Per-recipient failures (including timeouts) are tallied, never propagated.

use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Dispatch;
use crate::model::{DeliveryOutcome, OutboundMessage, RecipientPass, WalletPlatform};
use crate::resolver::Audience;
use crate::senders::PlatformSender;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchTotals {
    pub recipients: i64,
    pub success: i64,
    pub failure: i64,
    /// Most recent per-recipient error, kept for the request's `last_error`.
    pub last_error: Option<String>,
}

impl DispatchTotals {
    fn record(&mut self, outcome: DeliveryOutcome) {
        self.recipients += 1;
        if outcome.success {
            self.success += 1;
        } else {
            self.failure += 1;
            if outcome.error.is_some() {
                self.last_error = outcome.error;
            }
        }
    }

    pub fn merge(mut self, other: DispatchTotals) -> Self {
        self.recipients += other.recipients;
        self.success += other.success;
        self.failure += other.failure;
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct BatchDispatcher {
    widths: Dispatch,
    send_timeout: Duration,
}

impl BatchDispatcher {
    pub fn new(widths: Dispatch, send_timeout: Duration) -> Self {
        Self {
            widths,
            send_timeout,
        }
    }

    pub fn width_for(&self, platform: WalletPlatform) -> usize {
        let width = match platform {
            WalletPlatform::Apple => self.widths.apple_batch_width,
            WalletPlatform::Google => self.widths.google_batch_width,
        };
        width.max(1)
    }

    pub async fn dispatch(
        &self,
        recipients: &[RecipientPass],
        sender: &dyn PlatformSender,
        message: &OutboundMessage,
    ) -> DispatchTotals {
        let platform = sender.platform();
        let width = self.width_for(platform);
        let mut totals = DispatchTotals::default();

        for (index, batch) in recipients.chunks(width).enumerate() {
            let outcomes =
                join_all(batch.iter().map(|r| self.send_one(sender, r, message))).await;
            for outcome in outcomes {
                totals.record(outcome);
            }
            debug!(
                %platform,
                batch = index,
                size = batch.len(),
                success = totals.success,
                failure = totals.failure,
                "batch settled"
            );
        }
        totals
    }

    /// Apple partition first, then Google; the two never overlap in time.
    pub async fn dispatch_audience(
        &self,
        audience: &Audience,
        apple: &dyn PlatformSender,
        google: &dyn PlatformSender,
        message: &OutboundMessage,
    ) -> DispatchTotals {
        let apple_totals = self.dispatch(&audience.apple, apple, message).await;
        let google_totals = self.dispatch(&audience.google, google, message).await;
        let totals = apple_totals.merge(google_totals);
        info!(
            recipients = totals.recipients,
            success = totals.success,
            failure = totals.failure,
            "dispatch finished"
        );
        totals
    }

    async fn send_one(
        &self,
        sender: &dyn PlatformSender,
        recipient: &RecipientPass,
        message: &OutboundMessage,
    ) -> DeliveryOutcome {
        match tokio::time::timeout(self.send_timeout, sender.notify(recipient, message)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::failed(
                &recipient.id,
                format!("timed out after {}ms", self.send_timeout.as_millis()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PassState;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn passes(prefix: &str, n: usize, platform: WalletPlatform) -> Vec<RecipientPass> {
        (0..n)
            .map(|i| RecipientPass {
                id: format!("{prefix}{i}"),
                platform,
                campaign_id: 1,
                state: PassState::default(),
                verified: true,
                installed_on_ios: false,
                installed_on_android: false,
                deleted: false,
            })
            .collect()
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            header: "Bean Bar".into(),
            body: "Free refill".into(),
        }
    }

    struct ScriptedSender {
        platform: WalletPlatform,
        failing: HashSet<String>,
        hang: HashSet<String>,
        attempts: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedSender {
        fn new(platform: WalletPlatform, failing: &[&str], hang: &[&str]) -> Self {
            Self {
                platform,
                failing: failing.iter().map(|s| s.to_string()).collect(),
                hang: hang.iter().map(|s| s.to_string()).collect(),
                attempts: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PlatformSender for ScriptedSender {
        fn platform(&self) -> WalletPlatform {
            self.platform
        }

        async fn notify(&self, recipient: &RecipientPass, _message: &OutboundMessage) -> DeliveryOutcome {
            self.attempts.lock().unwrap().push(recipient.id.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if self.hang.contains(&recipient.id) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(&recipient.id) {
                DeliveryOutcome::failed(&recipient.id, "boom")
            } else {
                DeliveryOutcome::delivered(&recipient.id)
            }
        }
    }

    fn dispatcher() -> BatchDispatcher {
        BatchDispatcher::new(Dispatch::default(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let recipients = passes("g", 10, WalletPlatform::Google);
        let sender = ScriptedSender::new(WalletPlatform::Google, &["g2"], &[]);

        let totals = dispatcher().dispatch(&recipients, &sender, &message()).await;

        assert_eq!(sender.attempts.lock().unwrap().len(), 10);
        assert_eq!(totals.success, 9);
        assert_eq!(totals.failure, 1);
        assert_eq!(totals.recipients, 10);
        assert_eq!(totals.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_platform_width() {
        let recipients = passes("a", 45, WalletPlatform::Apple);
        let sender = ScriptedSender::new(WalletPlatform::Apple, &[], &[]);

        let totals = dispatcher().dispatch(&recipients, &sender, &message()).await;

        assert_eq!(totals.success, 45);
        assert!(sender.max_in_flight.load(Ordering::SeqCst) <= 20);

        let google = passes("g", 25, WalletPlatform::Google);
        let sender = ScriptedSender::new(WalletPlatform::Google, &[], &[]);
        dispatcher().dispatch(&google, &sender, &message()).await;
        assert!(sender.max_in_flight.load(Ordering::SeqCst) <= 10);
    }

    #[tokio::test]
    async fn hung_send_times_out_as_failure() {
        let recipients = passes("g", 3, WalletPlatform::Google);
        let sender = ScriptedSender::new(WalletPlatform::Google, &[], &["g1"]);
        let dispatcher = BatchDispatcher::new(Dispatch::default(), Duration::from_millis(100));

        let totals = dispatcher.dispatch(&recipients, &sender, &message()).await;

        assert_eq!(totals.success, 2);
        assert_eq!(totals.failure, 1);
        assert_eq!(totals.last_error.as_deref(), Some("timed out after 100ms"));
    }

    #[tokio::test]
    async fn audience_totals_cover_both_partitions() {
        let audience = Audience {
            apple: passes("a", 15, WalletPlatform::Apple),
            google: passes("g", 5, WalletPlatform::Google),
        };
        let apple = ScriptedSender::new(WalletPlatform::Apple, &["a3", "a11"], &[]);
        let google = ScriptedSender::new(WalletPlatform::Google, &["g4"], &[]);

        let totals = dispatcher()
            .dispatch_audience(&audience, &apple, &google, &message())
            .await;

        assert_eq!(totals.recipients, 20);
        assert_eq!(totals.success, 17);
        assert_eq!(totals.failure, 3);
        assert_eq!(totals.success + totals.failure, audience.len() as i64);
    }

    #[tokio::test]
    async fn empty_recipient_list_sends_nothing() {
        let sender = ScriptedSender::new(WalletPlatform::Apple, &[], &[]);
        let totals = dispatcher().dispatch(&[], &sender, &message()).await;
        assert_eq!(totals, DispatchTotals::default());
        assert!(sender.attempts.lock().unwrap().is_empty());
    }
}
