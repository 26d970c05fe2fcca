//! Audit record data structures

use chrono::{DateTime, Utc};
use opsgate_core::Actor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action recorded by an audit record, one per state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Approved,
    Rejected,
    Expired,
    Executed,
    ExecutionFailed,
    Cancelled,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Approved => "approved",
            AuditAction::Rejected => "rejected",
            AuditAction::Expired => "expired",
            AuditAction::Executed => "executed",
            AuditAction::ExecutionFailed => "execution_failed",
            AuditAction::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(AuditAction::Created),
            "approved" => Some(AuditAction::Approved),
            "rejected" => Some(AuditAction::Rejected),
            "expired" => Some(AuditAction::Expired),
            "executed" => Some(AuditAction::Executed),
            "execution_failed" => Some(AuditAction::ExecutionFailed),
            "cancelled" => Some(AuditAction::Cancelled),
            _ => None,
        }
    }
}

/// One signed, immutable entry in the audit ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic record id (storage rowid)
    pub id: i64,

    /// The approval request this record belongs to
    pub request_id: String,

    /// What happened
    pub action: AuditAction,

    /// Who did it
    pub actor_id: String,
    pub actor_name: String,
    pub actor_role: String,

    /// When it happened (UTC, microsecond precision)
    pub timestamp: DateTime<Utc>,

    /// Optional structured context (e.g., execution result, reject reason)
    pub details: Option<Value>,

    /// Request status before the transition (`None` for `created`)
    pub previous_status: Option<String>,

    /// Request status after the transition
    pub new_status: String,

    /// Hex-encoded HMAC-SHA256 over the canonical record encoding
    pub signature: String,
}

/// An audit record before it has been assigned an id and signature
///
/// Built by the engine for each transition; the ledger stamps the
/// timestamp, computes the signature, and persists it.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub request_id: String,
    pub action: AuditAction,
    pub actor: Actor,
    pub details: Option<Value>,
    pub previous_status: Option<String>,
    pub new_status: String,
}

impl NewAuditRecord {
    /// Convenience constructor for a transition record
    pub fn transition(
        request_id: impl Into<String>,
        action: AuditAction,
        actor: Actor,
        previous_status: Option<&str>,
        new_status: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            action,
            actor,
            details: None,
            previous_status: previous_status.map(str::to_string),
            new_status: new_status.into(),
        }
    }

    /// Attach structured details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}
