use thiserror::Error;
use uuid::Uuid;

use jobtalk_types::access::DenyReason;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Transport failure. The only retryable kind.
    #[error("network error: {0}")]
    Network(String),

    #[error("blocked: {0}")]
    Authorization(DenyReason),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("conversation {0} is already open")]
    AlreadyOpen(Uuid),

    #[error("conversation {0} is not open")]
    NotOpen(Uuid),

    #[error("message is empty")]
    EmptyMessage,

    #[error("no failed message {0} to retry")]
    UnknownEntry(Uuid),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Misuse of the coordinator API rather than a runtime condition.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::AlreadyOpen(_) | Self::NotOpen(_))
    }
}
