// CLUSTER ASSEMBLY
// Wires the connection manager, validator registry, per-chain consensus
// engines, sharding layer, bridge and telemetry around one event bus, and
// exposes one method per periodic duty.
//
// SAFETY INVARIANTS:
// 1. Identity (chains, validator keys) always comes from configuration;
//    persisted records only restore mutable state
// 2. Unreachable chains are skipped by consensus and rounds whose ledger
//    fails mid-attestation are aborted, so validators are never penalized
//    for a ledger outage
// 3. Shards are reassigned only after a round reached a terminal state

use chrono::Utc;
use guard_consensus::{
    ConsensusEngine, ConsensusError, EngineConfig, RegistryError, RoundOutcome, RoundResult,
    SlashingEngine, ValidatorRegistry,
};
use guard_core::{
    ChainId, ClusterConfig, ConfigurationError, EventBus, LedgerConnector, RoundFailureReason,
    ShardId, SyncStatus, TransferId, Validator,
};
use guard_interop::{
    BridgeConfig, ChainConnectionManager, ChainError, CrossChainBridge, LedgerHeightAttestor,
};
use guard_state::{ShardError, ShardingLayer, StateStore, StorageError};
use guard_telemetry::{Autoscaler, ClusterMetrics, ClusterMonitor};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("chain {0} is not part of this cluster")]
    UnknownChain(ChainId),
}

/// Outcome of one bridge sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<TransferId>,
    pub completed: Vec<TransferId>,
    /// Confirmed transfers whose destination credit failed again
    pub retrying: Vec<TransferId>,
}

pub struct Cluster {
    config: ClusterConfig,
    bus: EventBus,
    registry: Arc<ValidatorRegistry>,
    slashing: Arc<SlashingEngine>,
    chains: Arc<ChainConnectionManager>,
    engines: HashMap<ChainId, Arc<ConsensusEngine>>,
    sharding: Arc<ShardingLayer>,
    bridge: Arc<CrossChainBridge>,
    attestor: LedgerHeightAttestor,
    monitor: Arc<ClusterMonitor>,
    autoscaler: Autoscaler,
    store: Arc<dyn StateStore>,
    last_sample: Mutex<Instant>,
}

impl Cluster {
    /// Build every component from a validated configuration and reapply the
    /// state found in `store`.
    pub fn bootstrap(
        config: ClusterConfig,
        connector: Arc<dyn LedgerConnector>,
        store: Arc<dyn StateStore>,
    ) -> Result<Arc<Cluster>, ClusterError> {
        config.validate()?;
        let bus = EventBus::new();

        let chains = Arc::new(
            ChainConnectionManager::new(connector, config.timing.call_timeout(), bus.clone())
                .with_retries(config.timing.call_retries),
        );
        for chain in &config.supported_chains {
            chains.register_from_config(chain)?;
        }

        let registry = Arc::new(ValidatorRegistry::new());
        for validator in &config.validators {
            registry.register(Validator::new(
                validator.validator_id(),
                validator.chain_id(),
                validator.public_key_bytes()?,
                config.reputation.initial,
                validator.bridge,
            ))?;
        }

        let slashing = Arc::new(SlashingEngine::from_config(&config.reputation));
        let engine_config = EngineConfig::from_cluster(&config);
        let engines: HashMap<ChainId, Arc<ConsensusEngine>> = config
            .chain_ids()
            .into_iter()
            .map(|chain| {
                let engine = ConsensusEngine::new(
                    chain.clone(),
                    engine_config.clone(),
                    registry.clone(),
                    slashing.clone(),
                    bus.clone(),
                );
                (chain, Arc::new(engine))
            })
            .collect();

        let bridge = Arc::new(CrossChainBridge::new(
            BridgeConfig::from_cluster(&config),
            registry.clone(),
            chains.clone(),
            bus.clone(),
        ));

        let restored_chains = chains.restore(&store.load_chains()?);
        let restored_validators = registry.restore(&store.load_validators()?);
        let restored_transfers = bridge.restore(store.load_transfers()?);
        info!(
            "[Cluster] restored {} chains, {} validators, {} transfers",
            restored_chains, restored_validators, restored_transfers
        );

        let cluster = Cluster {
            sharding: Arc::new(ShardingLayer::new(config.shard_count, config.sharding.clone())),
            attestor: LedgerHeightAttestor::new(chains.clone()),
            monitor: Arc::new(ClusterMonitor::new(config.autoscaler.window)),
            autoscaler: Autoscaler::new(
                config.autoscaler.clone(),
                config.auto_scaling_enabled,
                bus.clone(),
            ),
            last_sample: Mutex::new(Instant::now()),
            config,
            bus,
            registry,
            slashing,
            chains,
            engines,
            bridge,
            store,
        };
        for chain in cluster.config.chain_ids() {
            cluster.reassign_shards(&chain)?;
        }

        info!(
            "[Cluster] bootstrapped {} chains, {} validators, {} shards per chain",
            cluster.engines.len(),
            cluster.registry.len(),
            cluster.sharding.shard_count()
        );
        Ok(Arc::new(cluster))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    pub fn slashing(&self) -> &Arc<SlashingEngine> {
        &self.slashing
    }

    pub fn chains(&self) -> &Arc<ChainConnectionManager> {
        &self.chains
    }

    pub fn sharding(&self) -> &Arc<ShardingLayer> {
        &self.sharding
    }

    pub fn bridge(&self) -> &Arc<CrossChainBridge> {
        &self.bridge
    }

    pub fn monitor(&self) -> &Arc<ClusterMonitor> {
        &self.monitor
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.chain_ids()
    }

    pub fn engine(&self, chain: &ChainId) -> Result<Arc<ConsensusEngine>, ClusterError> {
        self.engines.get(chain).cloned().ok_or_else(|| ClusterError::UnknownChain(chain.clone()))
    }

    /// Queue a transaction for the next rounds of `chain`.
    pub fn submit_transaction(
        &self,
        chain: &ChainId,
        transaction: impl Into<String>,
    ) -> Result<ShardId, ClusterError> {
        self.engine(chain)?;
        Ok(self.sharding.route_transaction(chain, transaction)?)
    }

    /// Partition the chain's currently active validators and record the
    /// assignment on its chain node.
    pub fn reassign_shards(&self, chain: &ChainId) -> Result<Vec<ShardId>, ClusterError> {
        let shards = self.sharding.assign_shards(chain, &self.registry.active_ids(chain))?;
        self.chains.set_shards(chain, shards.clone())?;
        Ok(shards)
    }

    pub async fn health_cycle(&self, chain: &ChainId) -> Result<SyncStatus, ClusterError> {
        let status = self.chains.poll_health(chain).await?;
        debug!("[Cluster] health of {}: {}", chain, status);
        Ok(status)
    }

    /// One consensus round for `chain` over the next batch of its shards.
    ///
    /// Returns `None` when the chain is unreachable and the round was skipped.
    pub async fn consensus_cycle(
        &self,
        chain: &ChainId,
    ) -> Result<Option<RoundResult>, ClusterError> {
        let engine = self.engine(chain)?;
        if !self.chains.is_reachable(chain) {
            debug!("[Cluster] {} unreachable, skipping round", chain);
            return Ok(None);
        }
        let height = match self.chains.block_height(chain).await {
            Ok(height) => height,
            Err(e) => {
                warn!("[Cluster] no height for {}, skipping round: {}", chain, e);
                return Ok(None);
            }
        };

        self.sharding.begin_round(chain)?;
        let batch = match self.sharding.take_default_batch(chain) {
            Ok(batch) => batch,
            Err(e) => {
                self.sharding.end_round(chain, false)?;
                return Err(e.into());
            }
        };

        let outcome = engine.run_round(height, batch.transactions(), &self.attestor).await;
        let committed = matches!(&outcome, Ok(result) if result.committed());
        self.sharding.end_round(chain, committed)?;
        if committed {
            self.sharding.record_processed(chain, &batch)?;
        } else {
            self.sharding.requeue(chain, batch)?;
        }
        let result = outcome?;
        if result.outcome == RoundOutcome::Failed(RoundFailureReason::LedgerUnavailable) {
            return Ok(Some(result));
        }

        if let Err(e) = self.chains.broadcast_vote(chain, &result.payload).await {
            warn!("[Cluster] vote broadcast for {} round {} failed: {}", chain, result.round, e);
        }
        if !result.slashed.is_empty() {
            self.reassign_shards(chain)?;
        }
        if self.sharding.maybe_rebalance(chain)? {
            info!("[Cluster] rebalanced shards of {} after round {}", chain, result.round);
        }
        Ok(Some(result))
    }

    /// Expire stale transfers, then retry the destination credit of every
    /// transfer still Confirmed.
    pub async fn bridge_sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            expired: self.bridge.expire_stale_transfers(Utc::now()),
            ..SweepReport::default()
        };
        for id in self.bridge.confirmed() {
            match self.bridge.finalize_transfer(&id).await {
                Ok(_) => report.completed.push(id),
                Err(e) => {
                    debug!("[Cluster] transfer {} not finalized: {}", id, e);
                    report.retrying.push(id);
                }
            }
        }
        report
    }

    /// Close a monitoring cycle and let the autoscaler judge it.
    pub fn metrics_cycle(&self) -> ClusterMetrics {
        let elapsed = {
            let mut last = self.last_sample.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let metrics = self.monitor.sample(&self.chains.snapshot(), elapsed);
        info!(
            "[Cluster] cycle {}: throughput {:.2}/s, latency {:.0}ms, success {:.0}%",
            metrics.cycle,
            metrics.throughput,
            metrics.avg_latency_ms,
            metrics.success_rate * 100.0
        );
        self.autoscaler.evaluate(&metrics);
        metrics
    }

    /// Write chains, validators and transfers to the state store.
    pub fn persist(&self) -> Result<(), ClusterError> {
        self.store.save_chains(&self.chains.snapshot())?;
        self.store.save_validators(&self.registry.snapshot())?;
        self.store.save_transfers(&self.bridge.snapshot())?;
        self.store.flush()?;
        debug!("[Cluster] state persisted");
        Ok(())
    }
}
