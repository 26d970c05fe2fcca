//! Audit ledger - signed append-only history
//!
//! Composes the append-only store with the keyed signer. This is the
//! only write path for audit records: `append` stamps the timestamp,
//! computes the signature over the canonical encoding, and inserts.

use crate::canonical::{canonical_message, canonical_timestamp};
use crate::error::AuditError;
use crate::record::{AuditRecord, NewAuditRecord};
use crate::signer::LedgerSigner;
use crate::store::AuditStore;
use chrono::Utc;
use std::path::Path;

/// Append-only, HMAC-signed audit ledger
pub struct AuditLedger {
    store: AuditStore,
    signer: LedgerSigner,
}

impl AuditLedger {
    /// Open (or create) a ledger at the given database path
    pub fn new<P: AsRef<Path>>(path: P, signer: LedgerSigner) -> Result<Self, AuditError> {
        Ok(Self {
            store: AuditStore::new(path)?,
            signer,
        })
    }

    /// Create an in-memory ledger (for testing)
    pub fn in_memory(signer: LedgerSigner) -> Result<Self, AuditError> {
        Ok(Self {
            store: AuditStore::in_memory()?,
            signer,
        })
    }

    /// Sign and append a record; returns it with id and signature set
    pub fn append(&self, new: NewAuditRecord) -> Result<AuditRecord, AuditError> {
        let timestamp = Utc::now();
        let timestamp_canonical = canonical_timestamp(&timestamp);

        let message = canonical_message(
            &new.request_id,
            new.action,
            &new.actor.id,
            &timestamp,
            new.details.as_ref(),
        );
        let signature = self.signer.sign(message.as_bytes());

        self.store.append_row(
            &new.request_id,
            new.action,
            &new.actor.id,
            &new.actor.name,
            &new.actor.role,
            &timestamp,
            &timestamp_canonical,
            new.details.as_ref(),
            new.previous_status.as_deref(),
            &new.new_status,
            &signature,
        )
    }

    /// Recompute and compare a record's signature (constant-time)
    pub fn verify(&self, record: &AuditRecord) -> bool {
        let message = canonical_message(
            &record.request_id,
            record.action,
            &record.actor_id,
            &record.timestamp,
            record.details.as_ref(),
        );
        self.signer.verify(message.as_bytes(), &record.signature)
    }

    /// Get one record by id
    pub fn get(&self, id: i64) -> Result<AuditRecord, AuditError> {
        self.store.get(id)
    }

    /// The ordered action history for one request
    pub fn records_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        self.store.for_request(request_id)
    }

    /// Verify every record of a request, surfacing the first mismatch
    ///
    /// A mismatch is an integrity incident; callers must halt trust in
    /// the affected record rather than ignore it.
    pub fn verify_request(&self, request_id: &str) -> Result<(), AuditError> {
        for record in self.store.for_request(request_id)? {
            if !self.verify(&record) {
                return Err(AuditError::SignatureMismatch {
                    record_id: record.id,
                });
            }
        }
        Ok(())
    }
}
