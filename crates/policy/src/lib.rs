//! OpsGate Policy Registry
//!
//! Static mapping from operation type to its approval rule set.
//! Loaded once at startup, read-only afterwards. Any operation type
//! absent from the registry is denied before a request is ever created.

pub mod error;
pub mod policy;
pub mod registry;

pub use error::PolicyError;
pub use policy::ApprovalPolicy;
pub use registry::PolicyRegistry;
