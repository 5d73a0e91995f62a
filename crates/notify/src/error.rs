use thiserror::Error;

use enforcement_core::DomainError;

use crate::store::StoreError;

/// Failure surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] DomainError),

    #[error("notification storage failed: {0}")]
    Storage(#[from] StoreError),
}
