//! Push request state machine and the operator commands that drive it.
//!
//! ```text
//! pending ──approve──> scheduled | queued ──claim──> processing ──> sent | failed
//! pending ──approve (inline)──> processing
//! pending ──reject───> rejected
//! scheduled | approved ──send now──> processing ──> sent | failed
//! ```
//!
//! Every arrow is a conditional update on the stored status. Only the caller
//! that wins the move into `processing` fans the message out.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::db::{self, DispatchRecord, Pool};
use crate::dispatch::{BatchDispatcher, DispatchTotals};
use crate::error::PushError;
use crate::model::{OutboundMessage, PushRequest, PushStatus};
use crate::resolver::RecipientResolver;
use crate::senders::PlatformSender;

/// Outcome handed back to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub request_id: i64,
    pub status: PushStatus,
    pub recipients_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_error: Option<String>,
}

impl From<&PushRequest> for PushReport {
    fn from(request: &PushRequest) -> Self {
        Self {
            request_id: request.id,
            status: request.status,
            recipients_count: request.recipients_count,
            success_count: request.success_count,
            failure_count: request.failure_count,
            last_error: request.last_error.clone(),
        }
    }
}

/// Decides whether an approved request is too large to send inline.
#[async_trait]
pub trait SizingPolicy: Send + Sync {
    async fn should_use_queue(&self, campaign_id: i64) -> anyhow::Result<bool>;
}

/// Queue when the eligible audience is larger than `threshold`.
pub struct AudienceThreshold {
    pool: Pool,
    threshold: i64,
}

impl AudienceThreshold {
    pub fn new(pool: Pool, threshold: i64) -> Self {
        Self { pool, threshold }
    }
}

#[async_trait]
impl SizingPolicy for AudienceThreshold {
    async fn should_use_queue(&self, campaign_id: i64) -> anyhow::Result<bool> {
        let audience = db::count_eligible_passes(&self.pool, campaign_id).await?;
        Ok(audience > self.threshold)
    }
}

pub struct PushLifecycle {
    pool: Pool,
    resolver: RecipientResolver,
    dispatcher: BatchDispatcher,
    apple: Arc<dyn PlatformSender>,
    google: Arc<dyn PlatformSender>,
    sizing: Arc<dyn SizingPolicy>,
}

impl PushLifecycle {
    pub fn new(
        pool: Pool,
        dispatcher: BatchDispatcher,
        apple: Arc<dyn PlatformSender>,
        google: Arc<dyn PlatformSender>,
        sizing: Arc<dyn SizingPolicy>,
    ) -> Self {
        Self {
            resolver: RecipientResolver::new(pool.clone()),
            pool,
            dispatcher,
            apple,
            google,
            sizing,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[instrument(skip(self, message))]
    pub async fn submit(
        &self,
        campaign_id: i64,
        message: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<PushReport, PushError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(PushError::Validation("message must be non-empty"));
        }
        if db::get_campaign(&self.pool, campaign_id).await?.is_none() {
            return Err(PushError::CampaignNotFound(campaign_id));
        }
        let id = db::insert_push_request(&self.pool, campaign_id, message, scheduled_at, Utc::now())
            .await?;
        info!(request_id = id, "push request submitted");
        Ok(PushReport::from(&self.load(id).await?))
    }

    pub async fn approve(&self, id: i64) -> Result<PushReport, PushError> {
        self.approve_at(id, Utc::now()).await
    }

    /// Approve as of `now`: defer when scheduled in the future, hand off to the
    /// background worker for large audiences, otherwise send inline.
    #[instrument(skip(self))]
    pub async fn approve_at(&self, id: i64, now: DateTime<Utc>) -> Result<PushReport, PushError> {
        let request = self.load(id).await?;
        if request.status != PushStatus::Pending {
            return Err(invalid_state(&request, "approve"));
        }

        if request.scheduled_at.is_some_and(|at| at > now) {
            self.transition(&request, PushStatus::Scheduled, now, "approve").await?;
            info!(request_id = id, scheduled_at = ?request.scheduled_at, "push request scheduled");
            return Ok(PushReport::from(&self.load(id).await?));
        }

        if self.sizing.should_use_queue(request.campaign_id).await? {
            self.transition(&request, PushStatus::Queued, now, "approve").await?;
            info!(request_id = id, "push request queued for background delivery");
            return Ok(PushReport::from(&self.load(id).await?));
        }

        // Inline sends claim straight from pending, so approval and claim are
        // one write and no send-now can get in between.
        self.transition(&request, PushStatus::Processing, now, "approve").await?;
        // An edit accepted before the claim is only on the row.
        let claimed = self.load(id).await?;
        self.deliver_claimed(claimed).await
    }

    #[instrument(skip(self, reason))]
    pub async fn reject(&self, id: i64, reason: &str) -> Result<PushReport, PushError> {
        let request = self.load(id).await?;
        if !PushStatus::can_transition(request.status, PushStatus::Rejected) {
            return Err(invalid_state(&request, "reject"));
        }
        if !db::reject_pending(&self.pool, id, reason).await? {
            return Err(invalid_state(&self.load(id).await?, "reject"));
        }
        info!(request_id = id, "push request rejected");
        Ok(PushReport::from(&self.load(id).await?))
    }

    /// Replace the outgoing text. Only while the request is `pending`.
    #[instrument(skip(self, new_message))]
    pub async fn edit(&self, id: i64, new_message: &str) -> Result<PushReport, PushError> {
        let new_message = new_message.trim();
        if new_message.is_empty() {
            return Err(PushError::Validation("message must be non-empty"));
        }
        let request = self.load(id).await?;
        if request.status != PushStatus::Pending {
            return Err(invalid_state(&request, "edit"));
        }
        if !db::update_pending_message(&self.pool, id, new_message, Utc::now()).await? {
            return Err(invalid_state(&self.load(id).await?, "edit"));
        }
        info!(request_id = id, "push request edited");
        Ok(PushReport::from(&self.load(id).await?))
    }

    /// Operator override for `scheduled` or `approved` requests. Anything else,
    /// including a request already sent, is rejected without sending.
    #[instrument(skip(self))]
    pub async fn send_now(&self, id: i64) -> Result<PushReport, PushError> {
        let request = self.load(id).await?;
        if !matches!(request.status, PushStatus::Scheduled | PushStatus::Approved) {
            return Err(invalid_state(&request, "send now"));
        }
        self.claim_and_deliver(request, Utc::now()).await
    }

    /// Move `request` from its current status into `processing`. `false` means
    /// someone else got there first.
    pub(crate) async fn try_claim(
        &self,
        request: &PushRequest,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if !PushStatus::can_transition(request.status, PushStatus::Processing) {
            return Ok(false);
        }
        db::transition_status(&self.pool, request.id, request.status, PushStatus::Processing, now)
            .await
    }

    async fn claim_and_deliver(
        &self,
        request: PushRequest,
        now: DateTime<Utc>,
    ) -> Result<PushReport, PushError> {
        self.transition(&request, PushStatus::Processing, now, "send now").await?;
        self.deliver_claimed(request).await
    }

    /// Resolve, fan out, and write the terminal outcome of a claimed request.
    /// Systemic failures end as `failed` with zeroed counters.
    #[instrument(skip_all, fields(request_id = request.id, campaign_id = request.campaign_id))]
    pub(crate) async fn deliver_claimed(&self, request: PushRequest) -> Result<PushReport, PushError> {
        let record = match self.fan_out(&request).await {
            Ok(totals) => outcome_record(totals),
            Err(err) => {
                error!(?err, "dispatch failed before any delivery");
                DispatchRecord {
                    status: PushStatus::Failed,
                    sent_at: None,
                    recipients_count: 0,
                    success_count: 0,
                    failure_count: 0,
                    last_error: Some(format!("{err:#}")),
                }
            }
        };

        if !db::complete_push_request(&self.pool, request.id, &record).await? {
            warn!("request left processing before its outcome was written");
            return Err(invalid_state(&self.load(request.id).await?, "record outcome"));
        }
        info!(
            status = %record.status,
            recipients = record.recipients_count,
            success = record.success_count,
            failure = record.failure_count,
            "push request finished"
        );
        Ok(PushReport {
            request_id: request.id,
            status: record.status,
            recipients_count: record.recipients_count,
            success_count: record.success_count,
            failure_count: record.failure_count,
            last_error: record.last_error,
        })
    }

    async fn fan_out(&self, request: &PushRequest) -> anyhow::Result<DispatchTotals> {
        let campaign = db::get_campaign(&self.pool, request.campaign_id)
            .await?
            .ok_or_else(|| anyhow!("campaign {} not found", request.campaign_id))?;
        let audience = self
            .resolver
            .resolve(campaign.id)
            .await
            .context("failed to resolve recipients")?;
        let message = OutboundMessage {
            header: campaign.message_header().to_string(),
            body: request.outgoing_text().to_string(),
        };
        Ok(self
            .dispatcher
            .dispatch_audience(&audience, self.apple.as_ref(), self.google.as_ref(), &message)
            .await)
    }

    async fn transition(
        &self,
        request: &PushRequest,
        to: PushStatus,
        now: DateTime<Utc>,
        action: &'static str,
    ) -> Result<(), PushError> {
        if !PushStatus::can_transition(request.status, to) {
            return Err(invalid_state(request, action));
        }
        if !db::transition_status(&self.pool, request.id, request.status, to, now).await? {
            return Err(invalid_state(&self.load(request.id).await?, action));
        }
        Ok(())
    }

    async fn load(&self, id: i64) -> Result<PushRequest, PushError> {
        db::get_push_request(&self.pool, id)
            .await?
            .ok_or(PushError::RequestNotFound(id))
    }
}

/// Zero recipients is a successful send; otherwise at least one delivery must
/// have landed.
fn outcome_record(totals: DispatchTotals) -> DispatchRecord {
    let status = if totals.recipients == 0 || totals.success > 0 {
        PushStatus::Sent
    } else {
        PushStatus::Failed
    };
    DispatchRecord {
        status,
        sent_at: Some(Utc::now()),
        recipients_count: totals.recipients,
        success_count: totals.success,
        failure_count: totals.failure,
        last_error: if totals.failure > 0 {
            totals.last_error
        } else {
            None
        },
    }
}

fn invalid_state(request: &PushRequest, action: &'static str) -> PushError {
    PushError::InvalidState {
        id: request.id,
        status: request.status,
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(recipients: i64, success: i64, failure: i64) -> DispatchTotals {
        DispatchTotals {
            recipients,
            success,
            failure,
            last_error: (failure > 0).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn zero_recipients_is_sent() {
        let record = outcome_record(totals(0, 0, 0));
        assert_eq!(record.status, PushStatus::Sent);
        assert_eq!(record.recipients_count, 0);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn any_success_is_sent_and_all_failures_is_failed() {
        let partial = outcome_record(totals(3, 1, 2));
        assert_eq!(partial.status, PushStatus::Sent);
        assert_eq!(partial.last_error.as_deref(), Some("boom"));

        let none = outcome_record(totals(3, 0, 3));
        assert_eq!(none.status, PushStatus::Failed);
        assert_eq!(none.success_count + none.failure_count, none.recipients_count);
    }
}
