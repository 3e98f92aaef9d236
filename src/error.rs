use serde::Serialize;
use thiserror::Error;

use crate::model::PushStatus;

/// Errors surfaced through the operator commands. Per-recipient delivery
/// failures never show up here; they are counted on the request instead.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("push request {0} not found")]
    RequestNotFound(i64),
    #[error("campaign {0} not found")]
    CampaignNotFound(i64),
    #[error("push request {id} is {status}; cannot {action}")]
    InvalidState {
        id: i64,
        status: PushStatus,
        action: &'static str,
    },
    #[error("invalid input: {0}")]
    Validation(&'static str),
    #[error("server error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Validation,
    ServerError,
}

impl PushError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PushError::RequestNotFound(_) | PushError::CampaignNotFound(_) => ErrorKind::NotFound,
            PushError::InvalidState { .. } => ErrorKind::InvalidState,
            PushError::Validation(_) => ErrorKind::Validation,
            PushError::Storage(_) => ErrorKind::ServerError,
        }
    }
}
