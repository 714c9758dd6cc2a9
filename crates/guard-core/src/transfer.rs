// BRIDGE TRANSFER RECORD
//
// SAFETY INVARIANTS:
// 1. Status is monotonic: Pending -> Confirmed -> Completed, or -> Failed
//    from Pending/Confirmed only. No reverse transition exists.
// 2. At most one signature per validator id
// 3. Fields other than status/signatures are immutable after creation
// 4. A transfer whose destination credit is in flight is never stale

use crate::error::TransitionError;
use crate::events::TransferFailure;
use crate::types::{ChainId, TransferId, ValidatorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Confirmed,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Confirmed, Completed) | (Pending, Failed) | (Confirmed, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "PENDING"),
            TransferStatus::Confirmed => write!(f, "CONFIRMED"),
            TransferStatus::Completed => write!(f, "COMPLETED"),
            TransferStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTransfer {
    pub id: TransferId,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub asset: String,
    pub amount: u64,
    pub required_signatures: usize,
    signatures: BTreeMap<ValidatorId, Vec<u8>>,
    status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<TransferFailure>,
    /// Reference returned by the destination ledger on credit
    pub destination_receipt: Option<String>,
    /// Destination credit in flight; process-local
    #[serde(skip)]
    crediting: bool,
}

impl BridgeTransfer {
    pub fn new(
        source_chain: ChainId,
        destination_chain: ChainId,
        asset: impl Into<String>,
        amount: u64,
        required_signatures: usize,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        BridgeTransfer {
            id: TransferId::generate(),
            source_chain,
            destination_chain,
            asset: asset.into(),
            amount,
            required_signatures,
            signatures: BTreeMap::new(),
            status: TransferStatus::Pending,
            created_at,
            deadline,
            completed_at: None,
            failure: None,
            destination_receipt: None,
            crediting: false,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn signatures(&self) -> &BTreeMap<ValidatorId, Vec<u8>> {
        &self.signatures
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn has_signed(&self, validator: &ValidatorId) -> bool {
        self.signatures.contains_key(validator)
    }

    pub fn threshold_reached(&self) -> bool {
        self.signatures.len() >= self.required_signatures
    }

    /// Digest every bridge signer signs: SHA-256 over the immutable fields.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.source_chain.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.destination_chain.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.asset.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.amount.to_le_bytes());
        hasher.finalize().into()
    }

    /// Insert a signature. Returns false if the validator already signed.
    pub fn add_signature(&mut self, validator: ValidatorId, signature: Vec<u8>) -> bool {
        if self.signatures.contains_key(&validator) {
            return false;
        }
        self.signatures.insert(validator, signature);
        true
    }

    pub fn transition(&mut self, next: TransferStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    pub fn fail(&mut self, reason: TransferFailure) -> Result<(), TransitionError> {
        self.transition(TransferStatus::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    pub fn complete(&mut self, at: DateTime<Utc>, receipt: String) -> Result<(), TransitionError> {
        self.transition(TransferStatus::Completed)?;
        self.completed_at = Some(at);
        self.destination_receipt = Some(receipt);
        Ok(())
    }

    pub fn is_crediting(&self) -> bool {
        self.crediting
    }

    /// Mark the destination credit as in flight. Returns false if it already was.
    pub fn begin_credit(&mut self) -> bool {
        !std::mem::replace(&mut self.crediting, true)
    }

    pub fn end_credit(&mut self) {
        self.crediting = false;
    }

    /// Past its deadline, still able to fail, and not being credited.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline && !self.status.is_terminal() && !self.crediting
    }
}

impl fmt::Display for BridgeTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer {} {} {} {} -> {} ({}, {}/{} signatures)",
            self.id,
            self.amount,
            self.asset,
            self.source_chain,
            self.destination_chain,
            self.status,
            self.signatures.len(),
            self.required_signatures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn transfer() -> BridgeTransfer {
        let now = Utc::now();
        BridgeTransfer::new(
            ChainId::new("alpha"),
            ChainId::new("beta"),
            "GUARD",
            100,
            2,
            now,
            now + Duration::seconds(60),
        )
    }

    #[test]
    fn test_allowed_transitions_only() {
        use TransferStatus::*;
        let all = [Pending, Confirmed, Completed, Failed];
        let allowed =
            [(Pending, Confirmed), (Confirmed, Completed), (Pending, Failed), (Confirmed, Failed)];
        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn test_completed_cannot_fail() {
        let mut t = transfer();
        t.transition(TransferStatus::Confirmed).unwrap();
        t.complete(Utc::now(), "rcpt".to_string()).unwrap();
        assert!(t.fail(TransferFailure::Expired).is_err());
        assert_eq!(t.status(), TransferStatus::Completed);
    }

    #[test]
    fn test_duplicate_signature_not_counted() {
        let mut t = transfer();
        assert!(t.add_signature(ValidatorId::new("v1"), vec![1]));
        assert!(!t.add_signature(ValidatorId::new("v1"), vec![2]));
        assert_eq!(t.signature_count(), 1);
        assert_eq!(t.signatures()[&ValidatorId::new("v1")], vec![1]);
    }

    #[test]
    fn test_digest_depends_on_amount() {
        let t = transfer();
        let mut other = t.clone();
        other.amount = 101;
        assert_ne!(t.signing_digest(), other.signing_digest());
        assert_eq!(t.signing_digest(), t.clone().signing_digest());
    }

    #[test]
    fn test_staleness() {
        let t = transfer();
        assert!(!t.is_stale(t.created_at));
        assert!(t.is_stale(t.deadline + Duration::seconds(1)));
    }

    #[test]
    fn test_credit_in_flight_is_never_stale() {
        let mut t = transfer();
        let late = t.deadline + Duration::seconds(1);
        assert!(t.begin_credit());
        assert!(!t.begin_credit());
        assert!(!t.is_stale(late));
        t.end_credit();
        assert!(t.is_stale(late));
    }
}
