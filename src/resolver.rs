//! Eligible-audience lookup, split by wallet backend.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::model::{RecipientPass, WalletPlatform};

#[derive(Debug, Clone, Default)]
pub struct Audience {
    pub apple: Vec<RecipientPass>,
    pub google: Vec<RecipientPass>,
}

impl Audience {
    /// Every pass lands in exactly one partition; see [`WalletPlatform::from_column`]
    /// for how passes without a platform are placed.
    pub fn partition(passes: Vec<RecipientPass>) -> Self {
        let (google, apple) = passes
            .into_iter()
            .partition(|p| p.platform == WalletPlatform::Google);
        Self { apple, google }
    }

    pub fn len(&self) -> usize {
        self.apple.len() + self.google.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct RecipientResolver {
    pool: Pool,
}

impl RecipientResolver {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Read-only. A storage error is returned as-is; callers must not treat it
    /// as an empty audience.
    #[instrument(skip(self))]
    pub async fn resolve(&self, campaign_id: i64) -> Result<Audience> {
        let passes = db::list_eligible_passes(&self.pool, campaign_id).await?;
        let audience = Audience::partition(passes);
        debug!(
            apple = audience.apple.len(),
            google = audience.google.len(),
            "resolved audience"
        );
        Ok(audience)
    }
}
