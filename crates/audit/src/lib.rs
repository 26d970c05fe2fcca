//! OpsGate Audit Ledger
//!
//! Append-only, cryptographically signed history of every state-changing
//! action taken against an approval request.
//!
//! ## Guarantees
//! - Insert-only: the storage interface exposes `append` and reads,
//!   nothing else. No update or delete exists.
//! - Every record carries an HMAC-SHA256 signature over a canonical
//!   encoding of its identifying fields, keyed by a process-wide secret.
//! - Verification is constant-time; a mismatch is an integrity incident,
//!   never silently repaired.

pub mod canonical;
pub mod error;
pub mod ledger;
pub mod record;
pub mod signer;
mod store;

pub use error::AuditError;
pub use ledger::AuditLedger;
pub use record::{AuditAction, AuditRecord, NewAuditRecord};
pub use signer::LedgerSigner;
