//! What a validator votes on.
//!
//! Every round attests to a [`Proposal`]: the chain height the round is
//! anchored to and the digest of the transaction batch it carries. The
//! [`Attestor`] decides one validator's verdict; the engine never invents
//! votes on its own.

use async_trait::async_trait;
use guard_core::{ChainId, LedgerError, Validator};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub chain: ChainId,
    pub round: u64,
    pub height: u64,
    /// Hex SHA-256 over chain, round, height and the batch
    pub digest: String,
    pub transactions: Vec<String>,
}

impl Proposal {
    pub fn new(chain: ChainId, round: u64, height: u64, transactions: Vec<String>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(chain.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(round.to_le_bytes());
        hasher.update(height.to_le_bytes());
        for tx in &transactions {
            hasher.update(tx.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        Proposal { chain, round, height, digest, transactions }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub valid: bool,
    /// Reference to the validator's signature over the proposal, if it signed
    pub signature_ref: Option<String>,
}

impl Attestation {
    pub fn valid(signature_ref: impl Into<String>) -> Self {
        Attestation { valid: true, signature_ref: Some(signature_ref.into()) }
    }

    pub fn invalid() -> Self {
        Attestation { valid: false, signature_ref: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttestationError {
    #[error("ledger call failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("attestation timed out after {0}ms")]
    Timeout(u64),
    #[error("attestation rejected: {0}")]
    Rejected(String),
}

/// Verification predicate a validator applies to a proposal.
///
/// An `Err` counts as an invalid vote from that validator, except
/// [`AttestationError::Ledger`]: the chain itself failed, and the engine aborts
/// the round without charging anyone.
#[async_trait]
pub trait Attestor: Send + Sync {
    async fn attest(
        &self,
        validator: &Validator,
        proposal: &Proposal,
    ) -> Result<Attestation, AttestationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic_and_batch_sensitive() {
        let a = Proposal::new(ChainId::new("alpha"), 1, 10, vec!["tx-1".into()]);
        let b = Proposal::new(ChainId::new("alpha"), 1, 10, vec!["tx-1".into()]);
        let c = Proposal::new(ChainId::new("alpha"), 1, 10, vec!["tx-2".into()]);
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        assert_eq!(a.digest.len(), 64);
    }
}
