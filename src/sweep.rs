//! Periodic jobs: due scheduled requests, the background queue, and requests
//! abandoned mid-dispatch.
//!
//! None of these keep state between ticks. Running two sweepers at once is
//! safe because each request is claimed with a conditional update before it
//! is sent.

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::PushError;
use crate::lifecycle::PushLifecycle;
use crate::model::PushRequest;

const STALE_DISPATCH_ERROR: &str = "dispatch interrupted";

#[derive(Clone)]
pub struct Sweeper {
    pool: Pool,
    lifecycle: Arc<PushLifecycle>,
}

/// Counts from one [`Sweeper::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub recovered: u64,
    pub scheduled: usize,
    pub queued: usize,
}

impl TickSummary {
    pub fn is_idle(&self) -> bool {
        self.recovered == 0 && self.scheduled == 0 && self.queued == 0
    }
}

impl Sweeper {
    pub fn new(lifecycle: Arc<PushLifecycle>) -> Self {
        Self {
            pool: lifecycle.pool().clone(),
            lifecycle,
        }
    }

    /// Send scheduled requests due at `now`, oldest first, at most `limit`.
    /// Returns how many this call claimed and finished.
    #[instrument(skip(self))]
    pub async fn sweep_due(&self, now: DateTime<Utc>, limit: u32) -> Result<usize, PushError> {
        let due = db::list_due_scheduled(&self.pool, now, limit).await?;
        Ok(self.run_batch(due, now).await)
    }

    /// Send requests that approval handed off to the background queue.
    #[instrument(skip(self))]
    pub async fn process_queued(&self, now: DateTime<Utc>, limit: u32) -> Result<usize, PushError> {
        let queued = db::list_queued(&self.pool, limit).await?;
        Ok(self.run_batch(queued, now).await)
    }

    /// Fail requests claimed at least `older_than` ago that never recorded an
    /// outcome. They are not re-sent.
    #[instrument(skip(self))]
    pub async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<u64, PushError> {
        let cutoff = now
            .checked_sub_signed(older_than)
            .ok_or_else(|| anyhow!("stale window {older_than} is out of range"))?;
        let failed = db::fail_stale_processing(&self.pool, cutoff, STALE_DISPATCH_ERROR).await?;
        if failed > 0 {
            warn!(failed, "failed push requests abandoned mid-dispatch");
        }
        Ok(failed)
    }

    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        stale_after: Duration,
    ) -> Result<TickSummary, PushError> {
        Ok(TickSummary {
            recovered: self.recover_stale(now, stale_after).await?,
            scheduled: self.sweep_due(now, limit).await?,
            queued: self.process_queued(now, limit).await?,
        })
    }

    /// Tick until `shutdown` flips to true, sleeping `poll_interval` after an
    /// idle or failed tick.
    pub async fn run_loop(
        &self,
        poll_interval: std::time::Duration,
        limit: u32,
        stale_after: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick(Utc::now(), limit, stale_after).await {
                Ok(summary) if !summary.is_idle() => {
                    debug!(?summary, "sweep tick did work");
                    continue;
                }
                Ok(_) => {}
                Err(err) => error!(?err, "sweep tick failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!("sweeper stopped");
    }

    async fn run_batch(&self, requests: Vec<PushRequest>, now: DateTime<Utc>) -> usize {
        let mut processed = 0;
        for request in requests {
            let id = request.id;
            match self.lifecycle.try_claim(&request, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(request_id = id, "already claimed elsewhere; skipping");
                    continue;
                }
                Err(err) => {
                    warn!(request_id = id, ?err, "failed to claim push request");
                    continue;
                }
            }
            match self.lifecycle.deliver_claimed(request).await {
                Ok(report) => {
                    processed += 1;
                    info!(request_id = id, status = %report.status, "swept push request");
                }
                Err(err) => warn!(request_id = id, ?err, "failed to record swept push request"),
            }
        }
        processed
    }
}
