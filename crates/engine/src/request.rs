//! Approval request data structures

use chrono::{DateTime, Duration, Utc};
use opsgate_core::Actor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Status of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting approver sign-offs
    Pending,
    /// Approval threshold reached; terminal unless the policy
    /// auto-executes or an operator triggers manual execution
    Approved,
    /// Explicitly rejected by an approver
    Rejected,
    /// Timed out before the threshold was reached
    Expired,
    /// Withdrawn by the requester
    Cancelled,
    /// Handler ran and succeeded
    Executed,
    /// Handler ran and failed; requires a new request
    ExecutionFailed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Expired => "expired",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Executed => "executed",
            RequestStatus::ExecutionFailed => "execution_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            "expired" => Some(RequestStatus::Expired),
            "cancelled" => Some(RequestStatus::Cancelled),
            "executed" => Some(RequestStatus::Executed),
            "execution_failed" => Some(RequestStatus::ExecutionFailed),
            _ => None,
        }
    }

    /// True for statuses no transition ever leaves
    ///
    /// `Approved` is not listed: it is terminal only when the policy has
    /// `auto_execute = false` and nobody triggers manual execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Rejected
                | RequestStatus::Expired
                | RequestStatus::Cancelled
                | RequestStatus::Executed
                | RequestStatus::ExecutionFailed
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One approver's recorded sign-off on a pending request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSignoff {
    pub approver_id: String,
    pub approver_name: String,
    pub approved_at: DateTime<Utc>,
}

/// One approval request and its current state
///
/// `requester_*`, `payload`, and `reason` are immutable after creation;
/// a change to any of them in storage is a tamper signal. Rows are never
/// deleted - terminal requests are the historical record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique identifier, generated at creation
    pub id: String,

    /// Operation type, resolved against the policy registry
    pub operation_type: String,

    /// Who asked for this mutation
    pub requester_id: String,
    pub requester_name: String,

    /// Opaque structured data handed to the handler on execution
    pub payload: Value,

    /// Free-text justification supplied by the requester
    pub reason: String,

    /// Current state-machine status
    pub status: RequestStatus,

    pub created_at: DateTime<Utc>,

    /// created_at + policy timeout; always strictly after created_at
    pub expires_at: DateTime<Utc>,

    /// Running multi-approver tally (distinct approvers)
    pub approvals: Vec<ApprovalSignoff>,

    /// Final approver, set exactly once when the threshold is reached
    pub approved_by: Option<String>,
    pub approved_by_name: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,

    pub rejection_reason: Option<String>,

    /// Handler result (success payload or error detail)
    pub execution_result: Option<Value>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Create a new pending request for the given requester
    pub fn new(
        operation_type: impl Into<String>,
        requester: &Actor,
        payload: Value,
        reason: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let id = format!(
            "REQ-{}",
            uuid::Uuid::new_v4().to_string()[..8].to_uppercase()
        );
        let now = Utc::now();

        Self {
            id,
            operation_type: operation_type.into(),
            requester_id: requester.id.clone(),
            requester_name: requester.name.clone(),
            payload,
            reason: reason.into(),
            status: RequestStatus::Pending,
            created_at: now,
            expires_at: now + timeout,
            approvals: Vec::new(),
            approved_by: None,
            approved_by_name: None,
            approved_at: None,
            rejection_reason: None,
            execution_result: None,
            executed_at: None,
        }
    }

    /// Whether the deadline has passed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the given actor has already signed off
    pub fn has_signed(&self, actor_id: &str) -> bool {
        self.approvals.iter().any(|s| s.approver_id == actor_id)
    }

    /// Number of distinct sign-offs collected so far
    pub fn signoff_count(&self) -> usize {
        self.approvals.len()
    }
}
