//! Policy registry - constructed once, read-only afterwards
//!
//! The registry is injected into the engine at startup (no ambient
//! globals), so tests can run against fake policy sets.

use crate::error::PolicyError;
use crate::policy::ApprovalPolicy;
use std::collections::HashMap;
use std::path::Path;

/// Static registry of approval policies, keyed by operation type
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, ApprovalPolicy>,
}

impl PolicyRegistry {
    /// Build a registry from a set of policies, validating each one
    pub fn from_policies<I>(policies: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = ApprovalPolicy>,
    {
        let mut map = HashMap::new();

        for policy in policies {
            validate(&policy)?;
            if map.contains_key(&policy.operation_type) {
                return Err(PolicyError::DuplicateOperation(policy.operation_type));
            }
            map.insert(policy.operation_type.clone(), policy);
        }

        Ok(Self { policies: map })
    }

    /// Parse a registry from a JSON array of policies
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let policies: Vec<ApprovalPolicy> = serde_json::from_str(json)?;
        Self::from_policies(policies)
    }

    /// Load a registry from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PolicyError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Look up the policy for an operation type
    ///
    /// `None` means the operation type is unknown; the engine treats
    /// that as deny-by-default.
    pub fn lookup(&self, operation_type: &str) -> Option<&ApprovalPolicy> {
        self.policies.get(operation_type)
    }

    /// Number of registered policies
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// True if no policies are registered
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Iterate over all registered operation types
    pub fn operation_types(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

/// Validate a single policy before it enters the registry
fn validate(policy: &ApprovalPolicy) -> Result<(), PolicyError> {
    if policy.approval_count < 1 {
        return Err(PolicyError::InvalidApprovalCount(
            policy.operation_type.clone(),
        ));
    }

    if policy.timeout_minutes < 1 {
        return Err(PolicyError::InvalidTimeout(policy.operation_type.clone()));
    }

    if policy.approval_required && policy.approver_roles.is_empty() {
        return Err(PolicyError::NoApproverRoles(policy.operation_type.clone()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_policies() -> Vec<ApprovalPolicy> {
        vec![
            ApprovalPolicy::new("user_add").with_approver_roles(["Approver"]),
            ApprovalPolicy::new("cron_add")
                .with_approver_roles(["Approver", "Admin"])
                .with_timeout_minutes(60),
        ]
    }

    #[test]
    fn test_from_policies_and_lookup() {
        let registry = PolicyRegistry::from_policies(test_policies()).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.lookup("user_add").is_some());
        assert!(registry.lookup("cron_add").is_some());
        assert!(registry.lookup("unknown_op").is_none());
    }

    #[test]
    fn test_duplicate_operation_rejected() {
        let policies = vec![
            ApprovalPolicy::new("user_add").with_approver_roles(["Approver"]),
            ApprovalPolicy::new("user_add").with_approver_roles(["Admin"]),
        ];

        let result = PolicyRegistry::from_policies(policies);
        assert!(matches!(result, Err(PolicyError::DuplicateOperation(_))));
    }

    #[test]
    fn test_zero_approval_count_rejected() {
        let policy = ApprovalPolicy::new("user_add")
            .with_approver_roles(["Approver"])
            .with_approval_count(0);

        let result = PolicyRegistry::from_policies([policy]);
        assert!(matches!(result, Err(PolicyError::InvalidApprovalCount(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let policy = ApprovalPolicy::new("user_add")
            .with_approver_roles(["Approver"])
            .with_timeout_minutes(0);

        let result = PolicyRegistry::from_policies([policy]);
        assert!(matches!(result, Err(PolicyError::InvalidTimeout(_))));
    }

    #[test]
    fn test_no_approver_roles_rejected() {
        let policy = ApprovalPolicy::new("user_add");

        let result = PolicyRegistry::from_policies([policy]);
        assert!(matches!(result, Err(PolicyError::NoApproverRoles(_))));
    }

    #[test]
    fn test_from_json() {
        let json = r#"[
            {"operation_type": "user_add", "approver_roles": ["Approver"]},
            {"operation_type": "service_restart",
             "approver_roles": ["Admin"],
             "approval_count": 2,
             "auto_execute": true,
             "risk_level": "critical"}
        ]"#;

        let registry = PolicyRegistry::from_json(json).unwrap();
        assert_eq!(registry.len(), 2);

        let restart = registry.lookup("service_restart").unwrap();
        assert_eq!(restart.approval_count, 2);
        assert!(restart.auto_execute);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"operation_type": "user_add", "approver_roles": ["Approver"]}}]"#
        )
        .unwrap();

        let registry = PolicyRegistry::from_file(file.path()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_json() {
        let result = PolicyRegistry::from_json("not json");
        assert!(matches!(result, Err(PolicyError::Parse(_))));
    }
}
