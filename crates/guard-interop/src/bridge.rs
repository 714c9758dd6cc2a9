// CROSS-CHAIN BRIDGE
// Multi-signature asset transfers between two registered ledgers.
//
// SAFETY INVARIANTS:
// 1. Status is monotonic: Pending → Confirmed → Completed, or → Failed from
//    Pending/Confirmed only; nothing leaves Completed or Failed
// 2. Completed requires ≥ threshold distinct valid signatures from designated,
//    active bridge validators
// 3. 0 < amount ≤ max_transfer_amount
// 4. Records change only through the operations below
// 5. A transfer whose destination credit is in flight is never expired; the
//    in-flight mark lives on the record and is set and read under its lock
// 6. A credit only starts before the transfer's deadline

use crate::chain_manager::ChainConnectionManager;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use guard_consensus::ValidatorRegistry;
use guard_core::{
    BridgeTransfer, ChainId, ClusterConfig, ClusterEvent, EventBus, TransferFailure, TransferId,
    TransferStatus, ValidatorId,
};
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("invalid amount {amount}: must be in 1..={max}")]
    InvalidAmount { amount: u64, max: u64 },
    #[error("unknown chain {0}")]
    UnknownChain(ChainId),
    #[error("source and destination are both {0}")]
    SameChain(ChainId),
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),
    #[error("validator {validator} already signed transfer {transfer}")]
    DuplicateSignature { transfer: TransferId, validator: ValidatorId },
    #[error("validator {0} is not an active designated bridge signer")]
    UnauthorizedSigner(ValidatorId),
    #[error("signature from {validator} on transfer {transfer} does not verify")]
    SignatureRejected { transfer: TransferId, validator: ValidatorId },
    #[error("transfer {transfer} is {status}")]
    InvalidState { transfer: TransferId, status: TransferStatus },
    #[error("transfer {0} is already being finalized")]
    FinalizeInProgress(TransferId),
    #[error("destination {chain} unavailable for transfer {transfer}: {reason}")]
    DestinationUnavailable { transfer: TransferId, chain: ChainId, reason: String },
    #[error("transfer deadline is out of the representable time range")]
    DeadlineOutOfRange,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub max_transfer_amount: u64,
    pub signature_threshold: usize,
    pub transfer_deadline: chrono::Duration,
}

impl BridgeConfig {
    pub fn from_cluster(config: &ClusterConfig) -> Self {
        BridgeConfig {
            max_transfer_amount: config.max_transfer_amount,
            signature_threshold: config.bridge_signature_threshold,
            transfer_deadline: config.timing.transfer_deadline(),
        }
    }
}

/// Sign a transfer's digest as a bridge validator.
pub fn sign_transfer(key: &SigningKey, transfer: &BridgeTransfer) -> Vec<u8> {
    key.sign(&transfer.signing_digest()).to_bytes().to_vec()
}

/// Clears a transfer's in-flight credit mark when the finalize call ends,
/// including when its future is dropped mid-credit.
struct CreditGuard<'a> {
    transfers: &'a DashMap<TransferId, BridgeTransfer>,
    id: TransferId,
}

impl Drop for CreditGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut transfer) = self.transfers.get_mut(&self.id) {
            transfer.end_credit();
        }
    }
}

pub struct CrossChainBridge {
    transfers: DashMap<TransferId, BridgeTransfer>,
    registry: Arc<ValidatorRegistry>,
    chains: Arc<ChainConnectionManager>,
    config: BridgeConfig,
    bus: EventBus,
}

impl CrossChainBridge {
    pub fn new(
        config: BridgeConfig,
        registry: Arc<ValidatorRegistry>,
        chains: Arc<ChainConnectionManager>,
        bus: EventBus,
    ) -> Self {
        CrossChainBridge {
            transfers: DashMap::new(),
            registry,
            chains,
            config,
            bus,
        }
    }

    pub fn initiate_transfer(
        &self,
        source: &ChainId,
        destination: &ChainId,
        asset: &str,
        amount: u64,
    ) -> Result<TransferId, BridgeError> {
        self.initiate_transfer_at(source, destination, asset, amount, Utc::now())
    }

    pub fn initiate_transfer_at(
        &self,
        source: &ChainId,
        destination: &ChainId,
        asset: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<TransferId, BridgeError> {
        if amount == 0 || amount > self.config.max_transfer_amount {
            return Err(BridgeError::InvalidAmount { amount, max: self.config.max_transfer_amount });
        }
        for chain in [source, destination] {
            if self.chains.chain_node(chain).is_none() {
                return Err(BridgeError::UnknownChain(chain.clone()));
            }
        }
        if source == destination {
            return Err(BridgeError::SameChain(source.clone()));
        }
        let deadline = now
            .checked_add_signed(self.config.transfer_deadline)
            .ok_or(BridgeError::DeadlineOutOfRange)?;

        let transfer = BridgeTransfer::new(
            source.clone(),
            destination.clone(),
            asset,
            amount,
            self.config.signature_threshold,
            now,
            deadline,
        );
        let id = transfer.id;
        info!("[Bridge] initiated {}", transfer);
        self.transfers.insert(id, transfer);
        Ok(id)
    }

    /// Collect one bridge validator's signature over the transfer digest.
    ///
    /// Returns the transfer status after the signature was applied.
    pub fn submit_signature(
        &self,
        transfer_id: &TransferId,
        validator: &ValidatorId,
        signature: &[u8],
    ) -> Result<TransferStatus, BridgeError> {
        let mut transfer = self
            .transfers
            .get_mut(transfer_id)
            .ok_or(BridgeError::UnknownTransfer(*transfer_id))?;

        if transfer.has_signed(validator) {
            return Err(BridgeError::DuplicateSignature {
                transfer: *transfer_id,
                validator: validator.clone(),
            });
        }

        let signer = self
            .registry
            .get(validator)
            .filter(|v| v.bridge_signer && v.is_active())
            .ok_or_else(|| BridgeError::UnauthorizedSigner(validator.clone()))?;

        if transfer.status() != TransferStatus::Pending {
            let status = transfer.status();
            return Err(BridgeError::InvalidState { transfer: *transfer_id, status });
        }

        let verified = match (signer.verifying_key(), Signature::from_slice(signature)) {
            (Ok(key), Ok(signature)) => key.verify(&transfer.signing_digest(), &signature).is_ok(),
            _ => false,
        };

        if !verified {
            let reason = TransferFailure::SignatureRejected { validator: validator.clone() };
            if transfer.fail(reason.clone()).is_ok() {
                drop(transfer);
                warn!("[Bridge] transfer {} failed: bad signature from {}", transfer_id, validator);
                self.bus.publish(ClusterEvent::TransferFailed { transfer: *transfer_id, reason });
            }
            return Err(BridgeError::SignatureRejected {
                transfer: *transfer_id,
                validator: validator.clone(),
            });
        }

        transfer.add_signature(validator.clone(), signature.to_vec());
        if transfer.threshold_reached() && transfer.transition(TransferStatus::Confirmed).is_ok() {
            let signatures = transfer.signature_count();
            drop(transfer);
            self.bus
                .publish(ClusterEvent::TransferConfirmed { transfer: *transfer_id, signatures });
            return Ok(TransferStatus::Confirmed);
        }
        Ok(transfer.status())
    }

    /// Execute the destination credit of a Confirmed transfer.
    ///
    /// If the destination ledger cannot be reached the transfer stays
    /// Confirmed and may be retried until its deadline. A transfer already
    /// past its deadline is expired instead of credited.
    pub async fn finalize_transfer(&self, transfer_id: &TransferId) -> Result<String, BridgeError> {
        let transfer = self.begin_credit(transfer_id, Utc::now())?;
        let _guard = CreditGuard { transfers: &self.transfers, id: *transfer_id };

        let receipt = self
            .chains
            .submit_transfer(&transfer.destination_chain, &transfer.asset, transfer.amount)
            .await
            .map_err(|e| {
                warn!("[Bridge] destination credit for {} failed: {}", transfer_id, e);
                BridgeError::DestinationUnavailable {
                    transfer: *transfer_id,
                    chain: transfer.destination_chain.clone(),
                    reason: e.to_string(),
                }
            })?;

        {
            let mut record = self
                .transfers
                .get_mut(transfer_id)
                .ok_or(BridgeError::UnknownTransfer(*transfer_id))?;
            record
                .complete(Utc::now(), receipt.clone())
                .map_err(|e| BridgeError::InvalidState { transfer: *transfer_id, status: e.from })?;
        }

        info!("[Bridge] transfer {} completed, receipt {}", transfer_id, receipt);
        self.bus.publish(ClusterEvent::TransferCompleted {
            transfer: *transfer_id,
            source: transfer.source_chain.clone(),
            destination: transfer.destination_chain.clone(),
            asset: transfer.asset.clone(),
            amount: transfer.amount,
        });
        Ok(receipt)
    }

    /// Check a transfer can be credited and mark the credit in flight, all
    /// under the record's lock.
    fn begin_credit(
        &self,
        transfer_id: &TransferId,
        now: DateTime<Utc>,
    ) -> Result<BridgeTransfer, BridgeError> {
        let mut record = self
            .transfers
            .get_mut(transfer_id)
            .ok_or(BridgeError::UnknownTransfer(*transfer_id))?;
        if record.is_crediting() {
            return Err(BridgeError::FinalizeInProgress(*transfer_id));
        }
        if record.status() != TransferStatus::Confirmed || !record.threshold_reached() {
            let status = record.status();
            return Err(BridgeError::InvalidState { transfer: *transfer_id, status });
        }
        if record.is_stale(now) {
            let expired = record.fail(TransferFailure::Expired).is_ok();
            let status = record.status();
            drop(record);
            if expired {
                warn!("[Bridge] transfer {} expired before its credit", transfer_id);
                self.bus.publish(ClusterEvent::TransferFailed {
                    transfer: *transfer_id,
                    reason: TransferFailure::Expired,
                });
            }
            return Err(BridgeError::InvalidState { transfer: *transfer_id, status });
        }
        record.begin_credit();
        Ok(record.clone())
    }

    /// Fail every non-terminal transfer past its deadline.
    pub fn expire_stale_transfers(&self, now: DateTime<Utc>) -> Vec<TransferId> {
        let stale: Vec<TransferId> = self
            .transfers
            .iter()
            .filter(|entry| entry.value().is_stale(now))
            .map(|entry| *entry.key())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            let failed = match self.transfers.get_mut(&id) {
                Some(mut transfer) if transfer.is_stale(now) => {
                    transfer.fail(TransferFailure::Expired).is_ok()
                }
                _ => false,
            };
            if failed {
                warn!("[Bridge] transfer {} expired", id);
                let reason = TransferFailure::Expired;
                self.bus.publish(ClusterEvent::TransferFailed { transfer: id, reason });
                expired.push(id);
            }
        }
        expired
    }

    pub fn transfer(&self, transfer_id: &TransferId) -> Option<BridgeTransfer> {
        self.transfers.get(transfer_id).map(|entry| entry.value().clone())
    }

    /// Confirmed transfers waiting for their destination credit.
    pub fn confirmed(&self) -> Vec<TransferId> {
        self.transfers
            .iter()
            .filter(|entry| entry.value().status() == TransferStatus::Confirmed)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<BridgeTransfer> {
        let mut transfers: Vec<BridgeTransfer> =
            self.transfers.iter().map(|entry| entry.value().clone()).collect();
        transfers.sort_by_key(|t| t.created_at);
        transfers
    }

    /// Reload persisted transfers. Existing ids are left untouched.
    pub fn restore(&self, stored: Vec<BridgeTransfer>) -> usize {
        let mut restored = 0;
        for transfer in stored {
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.transfers.entry(transfer.id) {
                slot.insert(transfer);
                restored += 1;
            }
        }
        restored
    }
}
