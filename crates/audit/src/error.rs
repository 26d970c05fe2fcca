//! Audit ledger errors

use thiserror::Error;

/// Errors from the audit ledger
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Signature mismatch on audit record {record_id} - possible tampering")]
    SignatureMismatch { record_id: i64 },

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Unknown audit action: {0}")]
    UnknownAction(String),

    #[error("Audit record not found: {0}")]
    NotFound(i64),

    #[error("Corrupt audit record: {0}")]
    Corrupt(String),
}
