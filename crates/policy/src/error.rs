//! Policy errors

use thiserror::Error;

/// Errors from loading or validating the policy registry
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Duplicate operation type in policy set: {0}")]
    DuplicateOperation(String),

    #[error("Policy {0}: approval_count must be >= 1")]
    InvalidApprovalCount(String),

    #[error("Policy {0}: timeout_minutes must be >= 1")]
    InvalidTimeout(String),

    #[error("Policy {0}: approval required but no approver roles defined")]
    NoApproverRoles(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
