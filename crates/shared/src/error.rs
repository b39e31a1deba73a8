use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Refusal codes carried on the wire. Each is a terminal, one-way notice
/// delivered only to the initiating identity's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    Blocked,
    NotFound,
    Busy,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectCode,
    pub context: String,
}

impl Rejection {
    pub fn new(code: RejectCode, context: impl Into<String>) -> Self {
        Self {
            code,
            context: context.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("delivery refused by block relation")]
    Blocked,
    #[error("target does not exist: {0}")]
    NotFound(String),
    #[error("a call is already in progress for this pair")]
    Busy,
    #[error("ringing call went unanswered")]
    Timeout,
    #[error("operation references a terminal call or group: {0}")]
    Stale(String),
    #[error("session channel dropped")]
    TransportLost,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// The wire code for refusals that are reported back to the initiator.
    /// `TransportLost` and store failures are absorbed, never surfaced.
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            Self::Blocked => Some(RejectCode::Blocked),
            Self::NotFound(_) => Some(RejectCode::NotFound),
            Self::Busy => Some(RejectCode::Busy),
            Self::Stale(_) => Some(RejectCode::Stale),
            Self::Timeout | Self::TransportLost | Self::Store(_) => None,
        }
    }
}
