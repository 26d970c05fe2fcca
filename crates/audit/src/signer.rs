//! Keyed signer for audit records
//!
//! HMAC-SHA256 over the canonical record encoding, keyed by a
//! process-wide secret. The secret is loaded once at startup and never
//! leaves this type: it is not serialized, not logged, and `Debug`
//! redacts it.

use crate::error::AuditError;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Process-wide signing key for the audit ledger
#[derive(Clone)]
pub struct LedgerSigner {
    key: Vec<u8>,
}

impl LedgerSigner {
    /// Create a signer from raw key bytes
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, AuditError> {
        let key = key.into();
        if key.is_empty() {
            return Err(AuditError::InvalidKey("key must not be empty".to_string()));
        }
        Ok(Self { key })
    }

    /// Create a signer from a hex-encoded key (how the secret is
    /// usually delivered via config)
    pub fn from_hex(hex_key: &str) -> Result<Self, AuditError> {
        let key = hex::decode(hex_key)
            .map_err(|e| AuditError::InvalidKey(e.to_string()))?;
        Self::new(key)
    }

    /// Generate a fresh random 32-byte key
    pub fn generate() -> Self {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Sign a canonical message, returning the hex-encoded digest
    pub fn sign(&self, message: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key size");
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a hex-encoded signature against a canonical message
    ///
    /// Comparison happens inside `verify_slice`, which is constant-time.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };

        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key size");
        mac.update(message);
        mac.verify_slice(&signature).is_ok()
    }
}

impl fmt::Debug for LedgerSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerSigner")
            .field("key", &"<redacted>")
            .finish()
    }
}
