// In-process ledger network used by simulation mode and tests.
// Endpoints can be switched up, down or stalled (never answers) at runtime.

use super::{LedgerClient, LedgerConnector, LedgerError, VotePayload};
use crate::types::ChainId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    Up,
    Down,
    /// Accepts the call and never answers
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRecord {
    pub chain: ChainId,
    pub destination: ChainId,
    pub asset: String,
    pub amount: u64,
    pub receipt: String,
}

#[derive(Default)]
struct NetworkState {
    modes: HashMap<String, EndpointMode>,
    heights: HashMap<ChainId, u64>,
    votes: Vec<VotePayload>,
    credits: Vec<CreditRecord>,
}

#[derive(Clone, Default)]
pub struct InMemoryLedgerNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryLedgerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints are Up unless told otherwise.
    pub fn set_mode(&self, endpoint: &str, mode: EndpointMode) {
        self.state.lock().modes.insert(endpoint.to_string(), mode);
    }

    pub fn set_height(&self, chain: &ChainId, height: u64) {
        self.state.lock().heights.insert(chain.clone(), height);
    }

    pub fn advance(&self, chain: &ChainId, blocks: u64) -> u64 {
        let mut state = self.state.lock();
        let height = state.heights.entry(chain.clone()).or_insert(0);
        *height += blocks;
        *height
    }

    pub fn votes(&self) -> Vec<VotePayload> {
        self.state.lock().votes.clone()
    }

    pub fn credits(&self) -> Vec<CreditRecord> {
        self.state.lock().credits.clone()
    }

    fn mode(&self, endpoint: &str) -> EndpointMode {
        self.state.lock().modes.get(endpoint).copied().unwrap_or(EndpointMode::Up)
    }
}

impl LedgerConnector for InMemoryLedgerNetwork {
    fn connect(&self, chain: &ChainId, endpoint: &str) -> Arc<dyn LedgerClient> {
        Arc::new(InMemoryLedgerClient {
            chain: chain.clone(),
            endpoint: endpoint.to_string(),
            network: self.clone(),
        })
    }
}

pub struct InMemoryLedgerClient {
    chain: ChainId,
    endpoint: String,
    network: InMemoryLedgerNetwork,
}

impl InMemoryLedgerClient {
    async fn gate(&self) -> Result<(), LedgerError> {
        match self.network.mode(&self.endpoint) {
            EndpointMode::Up => Ok(()),
            EndpointMode::Down => Err(LedgerError::Unreachable(self.endpoint.clone())),
            EndpointMode::Stalled => std::future::pending().await,
        }
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedgerClient {
    async fn get_block_height(&self) -> Result<u64, LedgerError> {
        self.gate().await?;
        Ok(self.network.state.lock().heights.get(&self.chain).copied().unwrap_or(0))
    }

    async fn broadcast_vote(&self, payload: &VotePayload) -> Result<(), LedgerError> {
        self.gate().await?;
        self.network.state.lock().votes.push(payload.clone());
        Ok(())
    }

    async fn submit_transfer(
        &self,
        destination: &ChainId,
        asset: &str,
        amount: u64,
    ) -> Result<String, LedgerError> {
        self.gate().await?;
        let mut state = self.network.state.lock();
        let receipt = format!("{}-credit-{}", self.chain, state.credits.len() + 1);
        state.credits.push(CreditRecord {
            chain: self.chain.clone(),
            destination: destination.clone(),
            asset: asset.to_string(),
            amount,
            receipt: receipt.clone(),
        });
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_heights_and_credits() {
        let network = InMemoryLedgerNetwork::new();
        let chain = ChainId::new("alpha");
        network.set_height(&chain, 40);
        network.advance(&chain, 2);

        let client = network.connect(&chain, "mem://alpha-1");
        assert_eq!(client.get_block_height().await.unwrap(), 42);

        let receipt = client.submit_transfer(&chain, "GUARD", 5).await.unwrap();
        assert_eq!(receipt, "alpha-credit-1");
        assert_eq!(network.credits().len(), 1);
    }

    #[tokio::test]
    async fn test_down_endpoint_errors() {
        let network = InMemoryLedgerNetwork::new();
        network.set_mode("mem://alpha-1", EndpointMode::Down);
        let client = network.connect(&ChainId::new("alpha"), "mem://alpha-1");
        assert!(matches!(client.get_block_height().await, Err(LedgerError::Unreachable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_endpoint_never_answers() {
        let network = InMemoryLedgerNetwork::new();
        network.set_mode("mem://alpha-1", EndpointMode::Stalled);
        let client = network.connect(&ChainId::new("alpha"), "mem://alpha-1");
        let result = tokio::time::timeout(Duration::from_secs(5), client.get_block_height()).await;
        assert!(result.is_err());
    }
}
