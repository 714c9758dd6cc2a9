// Ledger-backed attestation: a validator confirms a proposal when the chain
// it votes for has actually reached the proposed height. A ledger that cannot
// be read is reported as a ledger error, never as the validator's fault.

use crate::chain_manager::{ChainConnectionManager, ChainError};
use async_trait::async_trait;
use guard_consensus::{Attestation, AttestationError, Attestor, Proposal};
use guard_core::{LedgerError, Validator};
use std::sync::Arc;

pub struct LedgerHeightAttestor {
    chains: Arc<ChainConnectionManager>,
}

impl LedgerHeightAttestor {
    pub fn new(chains: Arc<ChainConnectionManager>) -> Self {
        LedgerHeightAttestor { chains }
    }
}

#[async_trait]
impl Attestor for LedgerHeightAttestor {
    async fn attest(
        &self,
        validator: &Validator,
        proposal: &Proposal,
    ) -> Result<Attestation, AttestationError> {
        let observed = self.chains.block_height(&proposal.chain).await.map_err(|e| match e {
            ChainError::NoEndpointAvailable(chain) => {
                AttestationError::Ledger(LedgerError::Unreachable(chain.to_string()))
            }
            ChainError::Rejected { reason, .. } => {
                AttestationError::Ledger(LedgerError::Rejected(reason))
            }
            other => AttestationError::Rejected(other.to_string()),
        })?;

        if observed >= proposal.height {
            Ok(Attestation::valid(format!("{}@{}", validator.id, proposal.digest)))
        } else {
            Ok(Attestation::invalid())
        }
    }
}
