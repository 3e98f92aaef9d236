//! Row-shaped structs used by repositories.

use crate::model::PushStatus;
use chrono::{DateTime, Utc};

/// A device that registered for updates of one Apple pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppleRegistration {
    pub id: i64,
    pub pass_id: String,
    pub device_library_id: String,
    pub push_token: String,
}

/// Terminal outcome written back to a claimed push request in one update.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub status: PushStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub recipients_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_error: Option<String>,
}
