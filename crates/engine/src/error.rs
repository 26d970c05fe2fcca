//! Engine errors
//!
//! Variants group into the four caller-facing classes: validation
//! (rejected before anything happens), authorization (actor may not do
//! this), state (transition attempted from the wrong status, including
//! losing a race), and passthrough storage/audit failures. Validation
//! and authorization failures have no side effects and write no audit
//! record.

use crate::request::RequestStatus;
use crate::store::StoreError;
use opsgate_audit::AuditError;
use thiserror::Error;

/// Errors from the approval engine
#[derive(Debug, Error)]
pub enum EngineError {
    // === Validation ===
    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),

    #[error("Operation type {0} does not require approval")]
    ApprovalNotRequired(String),

    #[error("Payload is required")]
    MissingPayload,

    #[error("A non-empty reason is required")]
    MissingReason,

    // === Authorization ===
    #[error("Role {role} may not approve operation type {operation_type}")]
    RoleNotAllowed {
        role: String,
        operation_type: String,
    },

    #[error("Requesters cannot approve their own requests")]
    SelfApproval,

    #[error("Actor {0} has already signed off on this request")]
    DuplicateApproval(String),

    #[error("Only the requester may cancel a request")]
    NotRequester,

    #[error("Manual execution requires the Admin role")]
    AdminRequired,

    // === State ===
    #[error("Request not found: {0}")]
    NotFound(String),

    #[error("Request {request_id} is {status}, transition not allowed")]
    InvalidState {
        request_id: String,
        status: RequestStatus,
    },

    // === Passthrough ===
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),
}

impl EngineError {
    /// True for errors rejected before any check of request state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownOperation(_)
                | EngineError::ApprovalNotRequired(_)
                | EngineError::MissingPayload
                | EngineError::MissingReason
        )
    }

    /// True for actor-permission failures
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            EngineError::RoleNotAllowed { .. }
                | EngineError::SelfApproval
                | EngineError::DuplicateApproval(_)
                | EngineError::NotRequester
                | EngineError::AdminRequired
        )
    }

    /// True for wrong-status failures, including losing a race
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(_) | EngineError::InvalidState { .. }
        )
    }
}
