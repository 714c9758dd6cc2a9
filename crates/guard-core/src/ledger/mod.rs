//! Minimal capability the cluster consumes from each ledger.
//!
//! Only three operations are assumed: reading the block height, broadcasting
//! a vote payload and submitting a transfer credit. Clients are bound to one
//! endpoint; failover is the connection manager's job, not the client's.

pub mod memory;

use crate::types::ChainId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("endpoint {0} unreachable")]
    Unreachable(String),
    #[error("call to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },
    #[error("ledger rejected request: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Attestation payload broadcast to a ledger after a round reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotePayload {
    pub chain: ChainId,
    pub round: u64,
    pub height: u64,
    pub digest: String,
    pub committed: bool,
    pub positive_votes: usize,
    pub total_votes: usize,
    /// Signature references of the positive voters
    pub signatures: Vec<String>,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_block_height(&self) -> Result<u64, LedgerError>;

    async fn broadcast_vote(&self, payload: &VotePayload) -> Result<(), LedgerError>;

    /// Credit `amount` of `asset` on this ledger. Returns the ledger's receipt.
    async fn submit_transfer(
        &self,
        destination: &ChainId,
        asset: &str,
        amount: u64,
    ) -> Result<String, LedgerError>;
}

/// Builds endpoint-bound clients.
pub trait LedgerConnector: Send + Sync {
    fn connect(&self, chain: &ChainId, endpoint: &str) -> Arc<dyn LedgerClient>;
}
