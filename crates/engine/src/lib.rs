//! OpsGate Approval Engine
//!
//! Mandatory dual-control gate for dangerous system mutations. Every
//! gated operation becomes an `ApprovalRequest` that must pass the
//! state machine here before its registered handler ever runs.
//!
//! ## Guarantees
//! - Self-approval is impossible: the requester can never approve
//!   their own request.
//! - Every state transition is an atomic conditional update; of several
//!   racing actors at most one wins, the rest get a state error.
//! - Every successful transition writes exactly one signed audit record
//!   before the call returns.
//! - Handlers run only after the approved state is durably committed,
//!   and are never retried automatically.

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod request;
pub mod store;
pub mod sweeper;

pub use dispatch::{
    DispatchError, ExecutionDispatcher, HandlerError, HandlerRegistry, NoOpHandler,
    OperationHandler,
};
pub use engine::{ApprovalEngine, EngineStats, HistoryFilter, RequestWithHistory};
pub use error::EngineError;
pub use request::{ApprovalRequest, ApprovalSignoff, RequestStatus};
pub use store::{RequestStore, StoreError};
pub use sweeper::ExpirySweeper;
