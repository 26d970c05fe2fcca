//! Approval policy - the rule set for one operation type
//!
//! Policies are plain data loaded from a config file. Defaults are
//! conservative: approval required, single approver, 24h timeout, no
//! auto-execute.

use chrono::Duration;
use opsgate_core::RiskLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Approval rules for one operation type
///
/// Immutable at runtime; the engine only ever reads these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Unique operation type key (e.g., "user_add", "cron_add")
    pub operation_type: String,

    /// Whether mutations of this type must pass the approval gate
    #[serde(default = "default_approval_required")]
    pub approval_required: bool,

    /// Roles allowed to approve or reject requests of this type
    #[serde(default)]
    pub approver_roles: BTreeSet<String>,

    /// Number of distinct approvers required before pending -> approved
    #[serde(default = "default_approval_count")]
    pub approval_count: u32,

    /// Minutes before a pending request expires
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: i64,

    /// Whether the handler runs automatically once approved
    #[serde(default)]
    pub auto_execute: bool,

    /// Risk classification of this operation type
    #[serde(default = "default_risk_level")]
    pub risk_level: RiskLevel,
}

impl ApprovalPolicy {
    /// Create a policy with conservative defaults for the given type
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            approval_required: default_approval_required(),
            approver_roles: BTreeSet::new(),
            approval_count: default_approval_count(),
            timeout_minutes: default_timeout_minutes(),
            auto_execute: false,
            risk_level: default_risk_level(),
        }
    }

    /// Builder-style: set approver roles
    pub fn with_approver_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.approver_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style: set required approver count
    pub fn with_approval_count(mut self, count: u32) -> Self {
        self.approval_count = count;
        self
    }

    /// Builder-style: set timeout in minutes
    pub fn with_timeout_minutes(mut self, minutes: i64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    /// Builder-style: enable auto-execute on approval
    pub fn with_auto_execute(mut self, auto: bool) -> Self {
        self.auto_execute = auto;
        self
    }

    /// Builder-style: set risk level
    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = level;
        self
    }

    /// Timeout as a chrono duration
    pub fn timeout(&self) -> Duration {
        Duration::minutes(self.timeout_minutes)
    }

    /// Whether the given role may approve/reject requests of this type
    pub fn role_may_approve(&self, role: &str) -> bool {
        self.approver_roles.contains(role)
    }
}

// Default value functions for serde
fn default_approval_required() -> bool {
    true
}

fn default_approval_count() -> u32 {
    1
}

fn default_timeout_minutes() -> i64 {
    24 * 60
}

fn default_risk_level() -> RiskLevel {
    RiskLevel::High
}
