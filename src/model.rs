use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wallet backend a pass was issued for.
///
/// Passes issued before Google Wallet support carry no platform value. Those
/// rows, and any value other than `"google"`, are read as [`WalletPlatform::Apple`].
/// Rewriting legacy rows to an explicit `'apple'` is safe at any time; it does
/// not change which partition the pass lands in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WalletPlatform {
    Apple,
    Google,
}

impl WalletPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletPlatform::Apple => "apple",
            WalletPlatform::Google => "google",
        }
    }

    pub fn from_column(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("google") => WalletPlatform::Google,
            _ => WalletPlatform::Apple,
        }
    }
}

impl fmt::Display for WalletPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    Pending,
    /// Approved but not yet claimed. Inline approval claims straight from
    /// `pending`; requests left here go out through send-now.
    Approved,
    Scheduled,
    Queued,
    /// Claimed by exactly one dispatcher; never exposed as an operator target.
    Processing,
    Sent,
    Failed,
    Rejected,
}

impl PushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushStatus::Pending => "pending",
            PushStatus::Approved => "approved",
            PushStatus::Scheduled => "scheduled",
            PushStatus::Queued => "queued",
            PushStatus::Processing => "processing",
            PushStatus::Sent => "sent",
            PushStatus::Failed => "failed",
            PushStatus::Rejected => "rejected",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PushStatus::Pending),
            "approved" => Some(PushStatus::Approved),
            "scheduled" => Some(PushStatus::Scheduled),
            "queued" => Some(PushStatus::Queued),
            "processing" => Some(PushStatus::Processing),
            "sent" => Some(PushStatus::Sent),
            "failed" => Some(PushStatus::Failed),
            "rejected" => Some(PushStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PushStatus::Sent | PushStatus::Failed | PushStatus::Rejected
        )
    }

    pub fn can_transition(from: PushStatus, to: PushStatus) -> bool {
        matches!(
            (from, to),
            (PushStatus::Pending, PushStatus::Approved)
                | (PushStatus::Pending, PushStatus::Scheduled)
                | (PushStatus::Pending, PushStatus::Queued)
                | (PushStatus::Pending, PushStatus::Rejected)
                | (PushStatus::Pending, PushStatus::Processing)
                | (PushStatus::Approved, PushStatus::Processing)
                | (PushStatus::Scheduled, PushStatus::Processing)
                | (PushStatus::Queued, PushStatus::Processing)
                | (PushStatus::Processing, PushStatus::Sent)
                | (PushStatus::Processing, PushStatus::Failed)
        )
    }
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub id: i64,
    pub campaign_id: i64,
    pub message: String,
    pub edited_message: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
    pub status: PushStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub recipients_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_error: Option<String>,
}

impl PushRequest {
    /// Text that goes out to cardholders: the operator's edit wins over the
    /// submitted message.
    pub fn outgoing_text(&self) -> &str {
        self.edited_message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.message)
    }
}

/// Content the pass-generation endpoint renders for a pass.
///
/// Known keys are typed; anything else written by other parts of the system is
/// kept verbatim in `extra` so a merge never drops it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_news: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PassState {
    pub fn merge_message(&mut self, text: &str, at: DateTime<Utc>) {
        self.latest_news = Some(text.to_string());
        self.last_message_at = Some(at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientPass {
    pub id: String,
    pub platform: WalletPlatform,
    pub campaign_id: i64,
    pub state: PassState,
    pub verified: bool,
    pub installed_on_ios: bool,
    pub installed_on_android: bool,
    pub deleted: bool,
}

impl RecipientPass {
    /// Must agree with `db::repo::ELIGIBLE_PASS_PREDICATE`.
    pub fn is_eligible(&self) -> bool {
        !self.deleted && (self.verified || self.installed_on_ios || self.installed_on_android)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub business_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub config: Value,
    pub client: Client,
}

impl Campaign {
    /// Header shown above the message on Google Wallet cards.
    pub fn message_header(&self) -> &str {
        let business = self.client.business_name.trim();
        if business.is_empty() {
            &self.name
        } else {
            business
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub header: String,
    pub body: String,
}

/// Result of one send attempt to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub recipient_id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(recipient_id: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(recipient_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}
