use thiserror::Error;
use uuid::Uuid;

use crate::clients::ClientError;
use crate::policy::price::PriceValidationError;
use crate::policy::reason::RedemptionReason;

/// Failure taxonomy shared by every policy, allocation and request operation.
#[derive(Error, Debug)]
pub enum AccessError {
    /// Another caller holds the policy lock. Retryable.
    #[error("failed to acquire lock on subsidy access policy {0}")]
    LockAcquisitionFailed(Uuid),

    #[error(transparent)]
    PriceValidation(#[from] PriceValidationError),

    /// A definitive, classified denial.
    #[error("not redeemable: {0}")]
    NotRedeemable(RedemptionReason),

    #[error("subsidy access policy {0} not found")]
    PolicyNotFound(Uuid),

    #[error("learner credit request {0} not found")]
    RequestNotFound(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("failed to cancel assignments: {non_cancelable:?}")]
    CancellationFailed { non_cancelable: Vec<Uuid> },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AccessError {
    /// Stable class name, written into audit tracebacks and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AccessError::LockAcquisitionFailed(_) => "LockAcquisitionFailed",
            AccessError::PriceValidation(_) => "PriceValidationError",
            AccessError::NotRedeemable(r) => r.as_str(),
            AccessError::PolicyNotFound(_) => "PolicyNotFound",
            AccessError::RequestNotFound(_) => "RequestNotFound",
            AccessError::InvalidInput(_) => "InvalidInput",
            AccessError::Conflict(_) => "Conflict",
            AccessError::Allocation(_) => "AllocationException",
            AccessError::CancellationFailed { .. } => "CancellationFailed",
            AccessError::Client(_) => "ClientError",
            AccessError::Internal(_) => "InternalError",
        }
    }

    /// `kind: message` line recorded as an action traceback.
    pub fn traceback(&self) -> String {
        match self {
            AccessError::Internal(e) => format!("{}: {e:#}", self.kind()),
            other => format!("{}: {other}", other.kind()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AccessError::LockAcquisitionFailed(_))
    }
}
