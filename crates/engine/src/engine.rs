//! Approval engine - the state machine
//!
//! Single writer for both approval requests and audit records. Every
//! transition funnels through a conditional update on the request's
//! status column; the losing side of any race gets `InvalidState`.
//! Validation and authorization failures happen before any write and
//! leave no trace.

use crate::dispatch::ExecutionDispatcher;
use crate::error::EngineError;
use crate::request::{ApprovalRequest, ApprovalSignoff, RequestStatus};
use crate::store::{RequestStore, StoreError};
use chrono::{DateTime, Utc};
use opsgate_audit::{AuditAction, AuditLedger, AuditRecord, LedgerSigner, NewAuditRecord};
use opsgate_core::Actor;
use opsgate_policy::{ApprovalPolicy, PolicyRegistry};
use serde_json::{json, Value};
use std::sync::Arc;

/// Role required for manual execution of approved requests
const ADMIN_ROLE: &str = "Admin";

/// A request together with its ordered audit timeline
#[derive(Debug)]
pub struct RequestWithHistory {
    pub request: ApprovalRequest,
    pub history: Vec<AuditRecord>,
}

/// Filters and pagination for history queries
#[derive(Debug, Clone)]
pub struct HistoryFilter {
    pub status: Option<RequestStatus>,
    pub operation_type: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            status: None,
            operation_type: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Request counts per status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub expired: usize,
    pub cancelled: usize,
    pub executed: usize,
    pub execution_failed: usize,
}

/// The dual-control approval engine
///
/// All collaborators are injected at construction: the policy registry
/// and handler registry are built at startup, the stores are durable.
pub struct ApprovalEngine {
    pub(crate) registry: Arc<PolicyRegistry>,
    pub(crate) store: RequestStore,
    pub(crate) ledger: AuditLedger,
    pub(crate) dispatcher: ExecutionDispatcher,
}

impl ApprovalEngine {
    /// Create an engine over durable stores
    pub fn new(
        registry: Arc<PolicyRegistry>,
        store: RequestStore,
        ledger: AuditLedger,
        dispatcher: ExecutionDispatcher,
    ) -> Self {
        Self {
            registry,
            store,
            ledger,
            dispatcher,
        }
    }

    /// Create an engine over in-memory stores with a fresh signing key
    /// (for testing)
    pub fn in_memory(
        registry: PolicyRegistry,
        dispatcher: ExecutionDispatcher,
    ) -> Result<Self, EngineError> {
        Ok(Self::new(
            Arc::new(registry),
            RequestStore::in_memory()?,
            AuditLedger::in_memory(LedgerSigner::generate())?,
            dispatcher,
        ))
    }

    /// Create a new pending request for a gated operation
    ///
    /// Deny-by-default: unknown operation types are rejected before a
    /// request is ever created.
    pub fn create_request(
        &self,
        operation_type: &str,
        requester: &Actor,
        payload: Value,
        reason: &str,
    ) -> Result<ApprovalRequest, EngineError> {
        let policy = self.policy(operation_type)?;

        if !policy.approval_required {
            return Err(EngineError::ApprovalNotRequired(operation_type.to_string()));
        }
        if payload.is_null() {
            return Err(EngineError::MissingPayload);
        }
        if reason.trim().is_empty() {
            return Err(EngineError::MissingReason);
        }

        let request =
            ApprovalRequest::new(operation_type, requester, payload, reason, policy.timeout());
        self.store.insert(&request)?;

        self.ledger.append(
            NewAuditRecord::transition(
                &request.id,
                AuditAction::Created,
                requester.clone(),
                None,
                RequestStatus::Pending.as_str(),
            )
            .with_details(json!({
                "operation_type": operation_type,
                "risk_level": policy.risk_level.as_str(),
            })),
        )?;

        tracing::info!(
            request_id = %request.id,
            operation_type = %operation_type,
            requester = %requester.id,
            "Created approval request"
        );

        Ok(request)
    }

    /// Record an approver's sign-off; fires pending -> approved once the
    /// policy's threshold of distinct approvers is reached
    pub async fn approve(
        &self,
        request_id: &str,
        actor: &Actor,
    ) -> Result<ApprovalRequest, EngineError> {
        loop {
            let request = self.fetch(request_id)?;
            let policy = self.policy(&request.operation_type)?;

            self.check_pending(&request)?;
            self.check_approver(&policy, &request, actor)?;

            if request.is_expired_at(Utc::now()) {
                return Err(self.expire_on_touch(&request)?);
            }

            if request.has_signed(&actor.id) {
                return Err(EngineError::DuplicateApproval(actor.id.clone()));
            }

            let mut updated = request.approvals.clone();
            updated.push(ApprovalSignoff {
                approver_id: actor.id.clone(),
                approver_name: actor.name.clone(),
                approved_at: Utc::now(),
            });

            if (updated.len() as u32) < policy.approval_count {
                // Below threshold: grow the tally, stay pending. The
                // compare-and-swap fails if another approver got in
                // first, in which case we re-read and retry.
                if !self
                    .store
                    .append_signoff(request_id, &request.approvals, &updated)?
                {
                    continue;
                }

                tracing::info!(
                    request_id = %request_id,
                    approver = %actor.id,
                    signoffs = updated.len(),
                    required = policy.approval_count,
                    "Recorded partial approval"
                );
                return self.fetch(request_id);
            }

            // Threshold reached: the conditional update guards on both
            // status and the tally, so exactly one final approver wins.
            let approved_at = Utc::now();
            if !self.store.mark_approved(
                request_id,
                &request.approvals,
                &updated,
                &actor.id,
                &actor.name,
                &approved_at,
            )? {
                continue;
            }

            self.ledger.append(
                NewAuditRecord::transition(
                    request_id,
                    AuditAction::Approved,
                    actor.clone(),
                    Some(RequestStatus::Pending.as_str()),
                    RequestStatus::Approved.as_str(),
                )
                .with_details(json!({
                    "signoffs": updated.len(),
                    "final_approver": actor.id,
                })),
            )?;

            tracing::info!(
                request_id = %request_id,
                approver = %actor.id,
                "Request approved"
            );

            let approved = self.fetch(request_id)?;
            if policy.auto_execute {
                // Dispatch strictly after the approved state is durably
                // committed; a crash here leaves a recoverable approved
                // request for execute_manual.
                return self.run_execution(approved, actor).await;
            }
            return Ok(approved);
        }
    }

    /// Reject a pending request with a mandatory reason
    pub fn reject(
        &self,
        request_id: &str,
        actor: &Actor,
        reason: &str,
    ) -> Result<ApprovalRequest, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::MissingReason);
        }

        let request = self.fetch(request_id)?;
        let policy = self.policy(&request.operation_type)?;

        self.check_pending(&request)?;
        self.check_approver(&policy, &request, actor)?;

        if request.is_expired_at(Utc::now()) {
            return Err(self.expire_on_touch(&request)?);
        }

        if !self.store.mark_rejected(request_id, reason)? {
            return Err(self.lost_race(request_id)?);
        }

        self.ledger.append(
            NewAuditRecord::transition(
                request_id,
                AuditAction::Rejected,
                actor.clone(),
                Some(RequestStatus::Pending.as_str()),
                RequestStatus::Rejected.as_str(),
            )
            .with_details(json!({"reason": reason})),
        )?;

        tracing::info!(
            request_id = %request_id,
            approver = %actor.id,
            "Request rejected"
        );

        self.fetch(request_id)
    }

    /// Withdraw a pending request; only the requester may do this
    pub fn cancel(&self, request_id: &str, actor: &Actor) -> Result<ApprovalRequest, EngineError> {
        let request = self.fetch(request_id)?;

        if actor.id != request.requester_id {
            return Err(EngineError::NotRequester);
        }
        self.check_pending(&request)?;

        if request.is_expired_at(Utc::now()) {
            return Err(self.expire_on_touch(&request)?);
        }

        if !self.store.mark_cancelled(request_id)? {
            return Err(self.lost_race(request_id)?);
        }

        self.ledger.append(NewAuditRecord::transition(
            request_id,
            AuditAction::Cancelled,
            actor.clone(),
            Some(RequestStatus::Pending.as_str()),
            RequestStatus::Cancelled.as_str(),
        ))?;

        tracing::info!(request_id = %request_id, "Request cancelled by requester");

        self.fetch(request_id)
    }

    /// Manually execute an approved request (Admin only)
    ///
    /// The recovery path for `auto_execute = false` policies, and for
    /// requests left approved-but-not-executed by a crash.
    pub async fn execute_manual(
        &self,
        request_id: &str,
        actor: &Actor,
    ) -> Result<ApprovalRequest, EngineError> {
        if actor.role != ADMIN_ROLE {
            return Err(EngineError::AdminRequired);
        }

        let request = self.fetch(request_id)?;
        if request.status != RequestStatus::Approved {
            return Err(EngineError::InvalidState {
                request_id: request_id.to_string(),
                status: request.status,
            });
        }

        self.run_execution(request, actor).await
    }

    /// Transition all overdue pending requests to expired
    ///
    /// Each expiry is an independent conditional update, so the sweep
    /// is idempotent and safe to run concurrently with interactive
    /// approvals and with itself.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut expired = 0;

        for id in self.store.list_expired(&now)? {
            if self.store.mark_expired(&id)? {
                self.ledger.append(NewAuditRecord::transition(
                    &id,
                    AuditAction::Expired,
                    Actor::system(),
                    Some(RequestStatus::Pending.as_str()),
                    RequestStatus::Expired.as_str(),
                ))?;
                expired += 1;
            }
            // A request approved or rejected between the select and the
            // update no longer matches; skip it.
        }

        if expired > 0 {
            tracing::info!(count = expired, "Expired overdue approval requests");
        }

        Ok(expired)
    }

    /// Get a request with its full audit timeline
    pub fn get(&self, request_id: &str) -> Result<RequestWithHistory, EngineError> {
        let request = self.fetch(request_id)?;
        let history = self.ledger.records_for_request(request_id)?;

        Ok(RequestWithHistory { request, history })
    }

    /// All pending requests, optionally filtered by operation type
    pub fn list_pending(
        &self,
        operation_type: Option<&str>,
    ) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self.store.list_pending(operation_type)?)
    }

    /// All requests made by one requester
    pub fn list_by_requester(
        &self,
        requester_id: &str,
    ) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self.store.list_by_requester(requester_id)?)
    }

    /// Paginated request history
    pub fn list_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self.store.list_history(
            filter.status,
            filter.operation_type.as_deref(),
            filter.limit,
            filter.offset,
        )?)
    }

    /// Verify the audit trail of one request (integrity check)
    pub fn verify_audit(&self, request_id: &str) -> Result<(), EngineError> {
        Ok(self.ledger.verify_request(request_id)?)
    }

    /// Request counts per status
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            pending: self.store.count_by_status(RequestStatus::Pending)?,
            approved: self.store.count_by_status(RequestStatus::Approved)?,
            rejected: self.store.count_by_status(RequestStatus::Rejected)?,
            expired: self.store.count_by_status(RequestStatus::Expired)?,
            cancelled: self.store.count_by_status(RequestStatus::Cancelled)?,
            executed: self.store.count_by_status(RequestStatus::Executed)?,
            execution_failed: self.store.count_by_status(RequestStatus::ExecutionFailed)?,
        })
    }

    // === internals ===

    fn policy(&self, operation_type: &str) -> Result<ApprovalPolicy, EngineError> {
        self.registry
            .lookup(operation_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownOperation(operation_type.to_string()))
    }

    fn fetch(&self, request_id: &str) -> Result<ApprovalRequest, EngineError> {
        self.store.get(request_id).map_err(|e| match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Store(other),
        })
    }

    fn check_pending(&self, request: &ApprovalRequest) -> Result<(), EngineError> {
        if request.status != RequestStatus::Pending {
            return Err(EngineError::InvalidState {
                request_id: request.id.clone(),
                status: request.status,
            });
        }
        Ok(())
    }

    fn check_approver(
        &self,
        policy: &ApprovalPolicy,
        request: &ApprovalRequest,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        if !policy.role_may_approve(&actor.role) {
            return Err(EngineError::RoleNotAllowed {
                role: actor.role.clone(),
                operation_type: request.operation_type.clone(),
            });
        }
        if actor.id == request.requester_id {
            return Err(EngineError::SelfApproval);
        }
        Ok(())
    }

    /// Lazily expire a request touched after its deadline, then report
    /// the resulting state error to the caller
    fn expire_on_touch(&self, request: &ApprovalRequest) -> Result<EngineError, EngineError> {
        if self.store.mark_expired(&request.id)? {
            self.ledger.append(NewAuditRecord::transition(
                &request.id,
                AuditAction::Expired,
                Actor::system(),
                Some(RequestStatus::Pending.as_str()),
                RequestStatus::Expired.as_str(),
            ))?;

            tracing::info!(
                request_id = %request.id,
                "Expired overdue request on touch"
            );

            return Ok(EngineError::InvalidState {
                request_id: request.id.clone(),
                status: RequestStatus::Expired,
            });
        }

        // Someone else transitioned it first; report whatever it is now.
        self.lost_race(&request.id)
    }

    /// Build the state error for the losing side of a transition race
    fn lost_race(&self, request_id: &str) -> Result<EngineError, EngineError> {
        let current = self.fetch(request_id)?;
        Ok(EngineError::InvalidState {
            request_id: request_id.to_string(),
            status: current.status,
        })
    }

    /// Run the handler for an approved request and record the terminal
    /// outcome (executed or execution_failed; never retried)
    async fn run_execution(
        &self,
        request: ApprovalRequest,
        actor: &Actor,
    ) -> Result<ApprovalRequest, EngineError> {
        // Claim before dispatch. Of several racing executors exactly one
        // stamps the claim row, and only the claimant invokes the
        // handler; the approved -> executed update alone would race the
        // side effect, not just the state.
        if !self.store.claim_execution(&request.id, &Utc::now())? {
            return Err(self.lost_race(&request.id)?);
        }

        let outcome = self
            .dispatcher
            .dispatch(&request.operation_type, &request.payload)
            .await;
        let executed_at = Utc::now();

        match outcome {
            Ok(result) => {
                if !self
                    .store
                    .mark_executed(&request.id, &result, &executed_at)?
                {
                    return Err(self.lost_race(&request.id)?);
                }

                self.ledger.append(
                    NewAuditRecord::transition(
                        &request.id,
                        AuditAction::Executed,
                        actor.clone(),
                        Some(RequestStatus::Approved.as_str()),
                        RequestStatus::Executed.as_str(),
                    )
                    .with_details(json!({"result": result})),
                )?;

                tracing::info!(request_id = %request.id, "Request executed");
            }
            Err(e) => {
                let error = json!({"error": e.to_string()});
                if !self
                    .store
                    .mark_execution_failed(&request.id, &error, &executed_at)?
                {
                    return Err(self.lost_race(&request.id)?);
                }

                self.ledger.append(
                    NewAuditRecord::transition(
                        &request.id,
                        AuditAction::ExecutionFailed,
                        actor.clone(),
                        Some(RequestStatus::Approved.as_str()),
                        RequestStatus::ExecutionFailed.as_str(),
                    )
                    .with_details(error),
                )?;

                tracing::error!(
                    request_id = %request.id,
                    error = %e,
                    "Request execution failed"
                );
            }
        }

        self.fetch(&request.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{HandlerError, HandlerRegistry, NoOpHandler, OperationHandler};
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;

    struct FailingHandler;

    #[async_trait]
    impl OperationHandler for FailingHandler {
        fn name(&self) -> &str {
            "FailingHandler"
        }

        async fn execute(&self, _payload: &Value) -> Result<Value, HandlerError> {
            Err(HandlerError::Failed("wrapper exited with status 1".to_string()))
        }
    }

    fn test_registry() -> PolicyRegistry {
        use opsgate_policy::ApprovalPolicy;

        PolicyRegistry::from_policies([
            // Single approver, runs the handler as soon as approved
            ApprovalPolicy::new("user_add")
                .with_approver_roles(["Approver", "Admin"])
                .with_auto_execute(true),
            // Two distinct approvers required
            ApprovalPolicy::new("cron_add")
                .with_approver_roles(["Approver"])
                .with_approval_count(2),
            // Manual execution only
            ApprovalPolicy::new("service_restart").with_approver_roles(["Approver", "Admin"]),
            // Auto-execute with a handler that always fails
            ApprovalPolicy::new("disk_resize")
                .with_approver_roles(["Approver"])
                .with_auto_execute(true),
            // Policy registered without a matching handler
            ApprovalPolicy::new("fw_rule_add")
                .with_approver_roles(["Approver"])
                .with_auto_execute(true),
        ])
        .unwrap()
    }

    fn test_engine() -> ApprovalEngine {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register("user_add", std::sync::Arc::new(NoOpHandler))
            .unwrap();
        handlers
            .register("service_restart", std::sync::Arc::new(NoOpHandler))
            .unwrap();
        handlers
            .register("disk_resize", std::sync::Arc::new(FailingHandler))
            .unwrap();

        ApprovalEngine::in_memory(test_registry(), ExecutionDispatcher::new(handlers)).unwrap()
    }

    fn alice() -> Actor {
        Actor::new("alice", "Alice", "Approver")
    }

    fn bob() -> Actor {
        Actor::new("bob", "Bob", "Approver")
    }

    fn carol() -> Actor {
        Actor::new("carol", "Carol", "Approver")
    }

    fn admin() -> Actor {
        Actor::new("dave", "Dave", "Admin")
    }

    fn create(engine: &ApprovalEngine, op: &str) -> ApprovalRequest {
        engine
            .create_request(op, &alice(), json!({"target": "host-1"}), "Routine change")
            .unwrap()
    }

    /// Insert a request whose deadline already passed, bypassing the
    /// engine (the engine never creates one in that state).
    fn insert_overdue(engine: &ApprovalEngine, op: &str) -> ApprovalRequest {
        let mut request = ApprovalRequest::new(
            op,
            &alice(),
            json!({"target": "host-1"}),
            "Routine change",
            Duration::hours(1),
        );
        request.created_at = Utc::now() - Duration::minutes(61);
        request.expires_at = request.created_at + Duration::hours(1);
        engine.store.insert(&request).unwrap();
        request
    }

    #[test]
    fn test_create_request() {
        let engine = test_engine();
        let request = create(&engine, "user_add");

        assert_eq!(request.status, RequestStatus::Pending);
        assert!(request.expires_at > request.created_at);

        let history = engine.get(&request.id).unwrap().history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, AuditAction::Created);
        assert_eq!(history[0].new_status, "pending");
    }

    #[test]
    fn test_create_validation_errors() {
        let engine = test_engine();

        let unknown = engine.create_request("rm_rf", &alice(), json!({}), "why");
        assert!(matches!(unknown, Err(EngineError::UnknownOperation(_))));

        let no_payload = engine.create_request("user_add", &alice(), Value::Null, "why");
        assert!(matches!(no_payload, Err(EngineError::MissingPayload)));

        let no_reason = engine.create_request("user_add", &alice(), json!({}), "  ");
        assert!(matches!(no_reason, Err(EngineError::MissingReason)));
    }

    #[tokio::test]
    async fn test_self_approval_prohibited() {
        let engine = test_engine();
        let request = create(&engine, "user_add");

        let result = engine.approve(&request.id, &alice()).await;
        assert!(matches!(result, Err(EngineError::SelfApproval)));

        // No side effects: still pending, still one audit record
        let got = engine.get(&request.id).unwrap();
        assert_eq!(got.request.status, RequestStatus::Pending);
        assert_eq!(got.history.len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_role_denied() {
        let engine = test_engine();
        let request = create(&engine, "user_add");

        let viewer = Actor::new("eve", "Eve", "Viewer");
        let err = engine.approve(&request.id, &viewer).await.unwrap_err();
        assert!(err.is_authorization());
        assert!(matches!(err, EngineError::RoleNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_full_user_add_scenario() {
        let engine = test_engine();
        let request = create(&engine, "user_add");

        // Requester may not approve their own request
        let denied = engine.approve(&request.id, &alice()).await;
        assert!(matches!(denied, Err(EngineError::SelfApproval)));

        // A distinct approver takes it through approval and (policy says
        // auto_execute) execution
        let executed = engine.approve(&request.id, &bob()).await.unwrap();
        assert_eq!(executed.status, RequestStatus::Executed);
        assert_eq!(executed.approved_by.as_deref(), Some("bob"));
        assert_ne!(executed.approved_by, Some(executed.requester_id.clone()));
        assert_eq!(executed.execution_result, Some(json!({"status": "ok"})));

        let history = engine.get(&request.id).unwrap().history;
        let statuses: Vec<&str> = history.iter().map(|r| r.new_status.as_str()).collect();
        assert_eq!(statuses, vec!["pending", "approved", "executed"]);

        engine.verify_audit(&request.id).unwrap();
    }

    #[tokio::test]
    async fn test_multi_approver_tally() {
        let engine = test_engine();
        let request = create(&engine, "cron_add");

        // First sign-off: below threshold, stays pending, no transition
        // and therefore no extra audit record
        let partial = engine.approve(&request.id, &bob()).await.unwrap();
        assert_eq!(partial.status, RequestStatus::Pending);
        assert_eq!(partial.signoff_count(), 1);
        assert!(partial.approved_by.is_none());
        assert_eq!(engine.get(&request.id).unwrap().history.len(), 1);

        // Same approver cannot count twice
        let dup = engine.approve(&request.id, &bob()).await;
        assert!(matches!(dup, Err(EngineError::DuplicateApproval(_))));

        // Second distinct approver reaches the threshold
        let approved = engine.approve(&request.id, &carol()).await.unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(approved.signoff_count(), 2);
        assert_eq!(approved.approved_by.as_deref(), Some("carol"));

        let history = engine.get(&request.id).unwrap().history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].action, AuditAction::Approved);
    }

    #[test]
    fn test_reject() {
        let engine = test_engine();
        let request = create(&engine, "service_restart");

        let empty = engine.reject(&request.id, &bob(), "");
        assert!(matches!(empty, Err(EngineError::MissingReason)));

        let rejected = engine
            .reject(&request.id, &bob(), "Change freeze this week")
            .unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);
        assert_eq!(
            rejected.rejection_reason.as_deref(),
            Some("Change freeze this week")
        );

        let history = engine.get(&request.id).unwrap().history;
        assert_eq!(history[1].action, AuditAction::Rejected);
    }

    #[test]
    fn test_cancel_requester_only_and_idempotence() {
        let engine = test_engine();
        let request = create(&engine, "service_restart");

        let not_owner = engine.cancel(&request.id, &bob());
        assert!(matches!(not_owner, Err(EngineError::NotRequester)));

        let cancelled = engine.cancel(&request.id, &alice()).unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);

        // Second cancel loses: the request is no longer pending
        let again = engine.cancel(&request.id, &alice());
        assert!(matches!(
            again,
            Err(EngineError::InvalidState {
                status: RequestStatus::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_expired_request_cannot_be_approved() {
        let engine = test_engine();
        let request = insert_overdue(&engine, "user_add");

        // The approve attempt itself performs the expiry transition
        let result = engine.approve(&request.id, &bob()).await;
        assert!(matches!(
            result,
            Err(EngineError::InvalidState {
                status: RequestStatus::Expired,
                ..
            })
        ));

        let got = engine.get(&request.id).unwrap();
        assert_eq!(got.request.status, RequestStatus::Expired);
        assert_eq!(got.history.len(), 1);
        assert_eq!(got.history[0].action, AuditAction::Expired);
        assert_eq!(got.history[0].actor_id, "system");
    }

    #[test]
    fn test_sweep_expires_overdue_requests() {
        let engine = test_engine();
        let overdue = insert_overdue(&engine, "user_add");
        let fresh = create(&engine, "user_add");

        let expired = engine.sweep_expired(Utc::now()).unwrap();
        assert_eq!(expired, 1);

        let got = engine.get(&overdue.id).unwrap();
        assert_eq!(got.request.status, RequestStatus::Expired);
        // One expired record, no execution attempted
        assert_eq!(got.history.len(), 1);
        assert_eq!(got.history[0].action, AuditAction::Expired);
        assert!(got.request.execution_result.is_none());

        // Fresh request untouched; sweep is idempotent
        assert_eq!(
            engine.get(&fresh.id).unwrap().request.status,
            RequestStatus::Pending
        );
        assert_eq!(engine.sweep_expired(Utc::now()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_approve_reject_single_winner() {
        let engine = std::sync::Arc::new(test_engine());
        let request = create(&engine, "service_restart");

        let approve_engine = engine.clone();
        let approve_id = request.id.clone();
        let approve = tokio::spawn(async move {
            approve_engine.approve(&approve_id, &bob()).await
        });

        let reject_engine = engine.clone();
        let reject_id = request.id.clone();
        let reject = tokio::task::spawn_blocking(move || {
            reject_engine.reject(&reject_id, &carol(), "Not needed")
        });

        let (approve_result, reject_result) =
            (approve.await.unwrap(), reject.await.unwrap());

        let winners = [approve_result.is_ok(), reject_result.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(winners, 1, "exactly one of approve/reject must win");

        let final_status = engine.get(&request.id).unwrap().request.status;
        if approve_result.is_ok() {
            assert_eq!(final_status, RequestStatus::Approved);
            assert!(matches!(
                reject_result,
                Err(EngineError::InvalidState { .. })
            ));
        } else {
            assert_eq!(final_status, RequestStatus::Rejected);
            assert!(matches!(
                approve_result,
                Err(EngineError::InvalidState { .. })
            ));
        }

        // The loser left no audit record: created + exactly one decision
        let history = engine.get(&request.id).unwrap().history;
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_execution_failure_is_terminal() {
        let engine = test_engine();
        let request = create(&engine, "disk_resize");

        let failed = engine.approve(&request.id, &bob()).await.unwrap();
        assert_eq!(failed.status, RequestStatus::ExecutionFailed);

        let detail = failed.execution_result.unwrap();
        assert!(detail["error"]
            .as_str()
            .unwrap()
            .contains("wrapper exited with status 1"));

        let history = engine.get(&request.id).unwrap().history;
        let actions: Vec<AuditAction> = history.iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Created,
                AuditAction::Approved,
                AuditAction::ExecutionFailed
            ]
        );

        // Terminal: manual execution cannot resurrect it
        let retry = engine.execute_manual(&request.id, &admin()).await;
        assert!(matches!(retry, Err(EngineError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_manual_execute_runs_handler_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingHandler {
            calls: std::sync::Arc<AtomicUsize>,
        }

        #[async_trait]
        impl OperationHandler for CountingHandler {
            fn name(&self) -> &str {
                "CountingHandler"
            }

            async fn execute(&self, _payload: &Value) -> Result<Value, HandlerError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                // Keep the handler in flight long enough for the racing
                // executor to reach the claim
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                Ok(json!({"status": "ok"}))
            }
        }

        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(
                "service_restart",
                std::sync::Arc::new(CountingHandler {
                    calls: calls.clone(),
                }),
            )
            .unwrap();
        let engine = std::sync::Arc::new(
            ApprovalEngine::in_memory(test_registry(), ExecutionDispatcher::new(handlers))
                .unwrap(),
        );

        let request = create(&engine, "service_restart");
        engine.approve(&request.id, &bob()).await.unwrap();

        let mut tasks = Vec::new();
        for admin in [
            Actor::new("dave", "Dave", "Admin"),
            Actor::new("erin", "Erin", "Admin"),
        ] {
            let engine = engine.clone();
            let id = request.id.clone();
            tasks.push(tokio::spawn(async move {
                engine.execute_manual(&id, &admin).await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                winners += 1;
            }
        }

        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "privileged handler must run exactly once"
        );
        assert_eq!(winners, 1);

        let got = engine.get(&request.id).unwrap();
        assert_eq!(got.request.status, RequestStatus::Executed);
        // created, approved, executed - the losing executor wrote nothing
        assert_eq!(got.history.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_handler_is_execution_failure() {
        let engine = test_engine();
        let request = create(&engine, "fw_rule_add");

        // The gap is caught at dispatch time and is terminal
        let failed = engine.approve(&request.id, &bob()).await.unwrap();
        assert_eq!(failed.status, RequestStatus::ExecutionFailed);

        let detail = failed.execution_result.unwrap();
        assert!(detail["error"]
            .as_str()
            .unwrap()
            .contains("No handler registered"));

        let history = engine.get(&request.id).unwrap().history;
        assert_eq!(history[2].action, AuditAction::ExecutionFailed);
    }

    #[tokio::test]
    async fn test_manual_execute() {
        let engine = test_engine();
        let request = create(&engine, "service_restart");

        let approved = engine.approve(&request.id, &bob()).await.unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);

        // Approver role is not enough for manual execution
        let denied = engine.execute_manual(&request.id, &bob()).await;
        assert!(matches!(denied, Err(EngineError::AdminRequired)));

        let executed = engine.execute_manual(&request.id, &admin()).await.unwrap();
        assert_eq!(executed.status, RequestStatus::Executed);

        let statuses: Vec<String> = engine
            .get(&request.id)
            .unwrap()
            .history
            .iter()
            .map(|r| r.new_status.clone())
            .collect();
        assert_eq!(statuses, vec!["pending", "approved", "executed"]);
    }

    #[tokio::test]
    async fn test_audit_tamper_detection() {
        let engine = test_engine();
        let request = create(&engine, "user_add");
        engine.approve(&request.id, &bob()).await.unwrap();

        engine.verify_audit(&request.id).unwrap();

        let history = engine.get(&request.id).unwrap().history;
        let mut tampered = history[1].clone();
        tampered.actor_id = "mallory".to_string();
        assert!(!engine.ledger.verify(&tampered));
    }

    #[test]
    fn test_listings_and_stats() {
        let engine = test_engine();
        create(&engine, "user_add");
        create(&engine, "cron_add");
        let rejected = create(&engine, "service_restart");
        engine.reject(&rejected.id, &bob(), "no").unwrap();

        assert_eq!(engine.list_pending(None).unwrap().len(), 2);
        assert_eq!(engine.list_pending(Some("user_add")).unwrap().len(), 1);
        assert_eq!(engine.list_by_requester("alice").unwrap().len(), 3);
        assert_eq!(engine.list_by_requester("nobody").unwrap().len(), 0);

        let history = engine
            .list_history(&HistoryFilter {
                status: Some(RequestStatus::Rejected),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, rejected.id);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.executed, 0);
    }
}
