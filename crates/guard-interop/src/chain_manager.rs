// CHAIN CONNECTION MANAGER
// Per-ledger endpoint pools with ordered failover and a designated fallback.
//
// SAFETY INVARIANTS:
// 1. Every ledger call carries a bounded timeout; expiry is an endpoint failure
//    once the bounded same-endpoint retries are spent
// 2. A chain lock is never held across an await point
// 3. One chain's failures never block calls on another chain
// 4. Concurrent failure reports for the same endpoint advance the cursor once
// 5. A chain is never removed; it degrades to Unreachable instead

use dashmap::DashMap;
use futures::future::join_all;
use guard_core::{
    ChainConfig, ChainId, ChainNode, ClusterEvent, ConfigurationError, EndpointAdvance, EventBus,
    LedgerClient, LedgerConnector, LedgerError, ShardId, SyncStatus, VotePayload,
};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("unknown chain {0}")]
    UnknownChain(ChainId),
    #[error("chain {0} is already registered")]
    DuplicateChain(ChainId),
    #[error("no endpoint available for chain {0}")]
    NoEndpointAvailable(ChainId),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("chain {chain} rejected the request: {reason}")]
    Rejected { chain: ChainId, reason: String },
}

pub struct ChainConnectionManager {
    chains: DashMap<ChainId, Arc<RwLock<ChainNode>>>,
    clients: DashMap<(ChainId, String), Arc<dyn LedgerClient>>,
    connector: Arc<dyn LedgerConnector>,
    call_timeout: Duration,
    call_retries: u32,
    bus: EventBus,
}

impl ChainConnectionManager {
    pub fn new(connector: Arc<dyn LedgerConnector>, call_timeout: Duration, bus: EventBus) -> Self {
        ChainConnectionManager {
            chains: DashMap::new(),
            clients: DashMap::new(),
            connector,
            call_timeout,
            call_retries: 0,
            bus,
        }
    }

    /// Retry a failed call this many times on the same endpoint before
    /// failing over.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.call_retries = retries;
        self
    }

    pub fn register_chain(
        &self,
        name: &str,
        endpoints: Vec<String>,
        fallback_endpoint: Option<String>,
    ) -> Result<ChainNode, ChainError> {
        let node = ChainNode::new(name, endpoints, fallback_endpoint)?;
        let chain = node.chain_id.clone();
        match self.chains.entry(chain.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ChainError::DuplicateChain(chain)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let endpoints = node.endpoints.len();
                info!("[ChainManager] registered {} with {} endpoints", chain, endpoints);
                slot.insert(Arc::new(RwLock::new(node.clone())));
                Ok(node)
            }
        }
    }

    pub fn register_from_config(&self, config: &ChainConfig) -> Result<ChainNode, ChainError> {
        self.register_chain(
            &config.name,
            config.endpoints.clone(),
            config.fallback_endpoint.clone(),
        )
    }

    fn node(&self, chain: &ChainId) -> Result<Arc<RwLock<ChainNode>>, ChainError> {
        self.chains
            .get(chain)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ChainError::UnknownChain(chain.clone()))
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.chains.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn chain_node(&self, chain: &ChainId) -> Option<ChainNode> {
        self.chains.get(chain).map(|entry| entry.value().read().clone())
    }

    pub fn snapshot(&self) -> Vec<ChainNode> {
        let mut nodes: Vec<ChainNode> =
            self.chains.iter().map(|entry| entry.value().read().clone()).collect();
        nodes.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        nodes
    }

    pub fn is_reachable(&self, chain: &ChainId) -> bool {
        self.chain_node(chain).map(|node| node.is_reachable()).unwrap_or(false)
    }

    /// Reapply persisted node state. Returns how many chains were restored.
    ///
    /// Height always carries over. The failover cursor only carries over when
    /// the configured endpoint pool is unchanged.
    pub fn restore(&self, stored: &[ChainNode]) -> usize {
        let mut restored = 0;
        for record in stored {
            let Ok(node) = self.node(&record.chain_id) else {
                warn!(
                    "[ChainManager] skipping stored state for unconfigured chain {}",
                    record.chain_id
                );
                continue;
            };
            let mut node = node.write();
            node.height = record.height;
            let same_pool = node.endpoints == record.endpoints
                && node.fallback_endpoint == record.fallback_endpoint;
            if same_pool {
                node.active_index = record.active_index;
                node.on_fallback = record.on_fallback;
                node.degraded = record.degraded;
                node.status = record.status;
            }
            restored += 1;
        }
        restored
    }

    /// Record the sharding layer's assignment on the chain node.
    pub fn set_shards(&self, chain: &ChainId, shards: Vec<ShardId>) -> Result<(), ChainError> {
        self.node(chain)?.write().shards = shards;
        Ok(())
    }

    /// First healthy endpoint of the chain.
    pub fn active_endpoint(&self, chain: &ChainId) -> Result<String, ChainError> {
        let node = self.node(chain)?;
        let node = node.read();
        node.current_endpoint()
            .map(str::to_string)
            .ok_or_else(|| ChainError::NoEndpointAvailable(chain.clone()))
    }

    /// Advance past a failed endpoint and publish the resulting chain event.
    pub fn report_endpoint_failure(
        &self,
        chain: &ChainId,
        endpoint: &str,
    ) -> Result<EndpointAdvance, ChainError> {
        let advance = self.node(chain)?.write().advance_endpoint(endpoint);
        match &advance {
            EndpointAdvance::Advanced { endpoint: next } => {
                warn!(
                    "[ChainManager] {} endpoint {} failed, switching to {}",
                    chain, endpoint, next
                );
            }
            EndpointAdvance::Degraded { endpoint: fallback } => {
                self.bus.publish(ClusterEvent::ChainDegraded {
                    chain: chain.clone(),
                    fallback_endpoint: fallback.clone(),
                });
            }
            EndpointAdvance::Unreachable => {
                self.bus.publish(ClusterEvent::ChainUnreachable { chain: chain.clone() });
            }
            EndpointAdvance::Stale => {
                debug!("[ChainManager] stale failure report for {} on {}", endpoint, chain);
            }
        }
        Ok(advance)
    }

    fn client(&self, chain: &ChainId, endpoint: &str) -> Arc<dyn LedgerClient> {
        self.clients
            .entry((chain.clone(), endpoint.to_string()))
            .or_insert_with(|| self.connector.connect(chain, endpoint))
            .clone()
    }

    /// Run `op` against the chain's active endpoint. Timeouts and transport
    /// errors are retried on the same endpoint, then fail over, until the call
    /// succeeds or the chain is unreachable.
    pub async fn call<T, F, Fut>(&self, chain: &ChainId, op: F) -> Result<T, ChainError>
    where
        F: Fn(Arc<dyn LedgerClient>) -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        loop {
            let endpoint = self.active_endpoint(chain)?;
            let client = self.client(chain, &endpoint);

            let mut attempt = 0;
            let failure = loop {
                let attempted = tokio::time::timeout(self.call_timeout, op(client.clone())).await;
                let failure = match attempted {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(LedgerError::Rejected(reason))) => {
                        return Err(ChainError::Rejected { chain: chain.clone(), reason });
                    }
                    Ok(Err(e)) => e,
                    Err(_) => LedgerError::Timeout {
                        endpoint: endpoint.clone(),
                        timeout_ms: self.call_timeout.as_millis() as u64,
                    },
                };
                // another caller may already have moved the cursor on
                let still_active =
                    self.active_endpoint(chain).map(|active| active == endpoint).unwrap_or(false);
                if attempt >= self.call_retries || !still_active {
                    break failure;
                }
                attempt += 1;
                debug!(
                    "[ChainManager] retry {}/{} on {} for {}: {}",
                    attempt, self.call_retries, endpoint, chain, failure
                );
            };

            warn!("[ChainManager] call on {} failed: {}", chain, failure);
            if self.report_endpoint_failure(chain, &endpoint)? == EndpointAdvance::Unreachable {
                return Err(ChainError::NoEndpointAvailable(chain.clone()));
            }
        }
    }

    /// Read the chain height and record it on the node.
    pub async fn block_height(&self, chain: &ChainId) -> Result<u64, ChainError> {
        let height = self
            .call(chain, |client| async move { client.get_block_height().await })
            .await?;
        self.node(chain)?.write().observe_height(height);
        Ok(height)
    }

    pub async fn broadcast_vote(
        &self,
        chain: &ChainId,
        payload: &VotePayload,
    ) -> Result<(), ChainError> {
        self.call(chain, |client| {
            let payload = payload.clone();
            async move { client.broadcast_vote(&payload).await }
        })
        .await
    }

    /// Credit `amount` of `asset` on `destination`. Returns the ledger receipt.
    pub async fn submit_transfer(
        &self,
        destination: &ChainId,
        asset: &str,
        amount: u64,
    ) -> Result<String, ChainError> {
        self.call(destination, |client| {
            let destination = destination.clone();
            let asset = asset.to_string();
            async move { client.submit_transfer(&destination, &asset, amount).await }
        })
        .await
    }

    /// One health poll.
    ///
    /// A chain that is off its primary endpoint (or unreachable) first polls
    /// the primary directly; if it answers the chain returns to it.
    pub async fn poll_health(&self, chain: &ChainId) -> Result<SyncStatus, ChainError> {
        let node = self.node(chain)?;
        let (primary, off_primary, was_unreachable) = {
            let node = node.read();
            (
                node.primary_endpoint().to_string(),
                node.on_fallback || node.active_index != 0,
                !node.is_reachable(),
            )
        };

        if off_primary || was_unreachable {
            let client = self.client(chain, &primary);
            let answered = tokio::time::timeout(self.call_timeout, client.get_block_height()).await;
            if let Ok(Ok(_)) = answered {
                node.write().recover();
                info!("[ChainManager] {} primary endpoint {} is back", chain, primary);
                self.bus.publish(ClusterEvent::ChainRecovered { chain: chain.clone() });
                return Ok(node.read().status);
            }
            if was_unreachable {
                return Ok(SyncStatus::Unreachable);
            }
        }

        match self.block_height(chain).await {
            Ok(_) => Ok(node.read().status),
            Err(ChainError::NoEndpointAvailable(_)) => Ok(SyncStatus::Unreachable),
            Err(e) => Err(e),
        }
    }

    /// Poll every chain concurrently.
    pub async fn poll_all(&self) -> Vec<(ChainId, Result<SyncStatus, ChainError>)> {
        let chains = self.chain_ids();
        let results = join_all(chains.iter().map(|chain| self.poll_health(chain))).await;
        chains.into_iter().zip(results).collect()
    }
}
