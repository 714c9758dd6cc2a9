// SHARDING LAYER
// Partitions each chain's active validators and transaction queue into a
// fixed number of shards.
//
// SAFETY INVARIANTS:
// 1. Assignment is deterministic: validators sorted by id, shard = index mod n
// 2. Per chain, shards form a partition: every assigned validator is in
//    exactly one shard
// 3. Validator reassignment and queue rebalancing only happen while every
//    shard of the chain is in a terminal round state
// 4. Transactions are never dropped: a failed round requeues its batch at
//    the front of the originating shard
//
// Shard validator sets are an auditable view of the partition; rounds vote
// over the chain's whole active set and only drain the shard queues.

use dashmap::DashMap;
use guard_core::{ChainId, ShardId, ShardingConfig, ValidatorId};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    #[error("no shards assigned for chain {0}")]
    UnknownChain(ChainId),
    #[error("chain {0} has a round in progress")]
    RoundInProgress(ChainId),
    #[error("chain {0} has no open round")]
    NoOpenRound(ChainId),
}

/// Round state of the validators in a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRoundState {
    Idle,
    Open,
    Committed,
    Failed,
}

impl ShardRoundState {
    pub fn is_terminal(self) -> bool {
        self != ShardRoundState::Open
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub chain: ChainId,
    pub validators: Vec<ValidatorId>,
    pub queue: VecDeque<String>,
    pub round_state: ShardRoundState,
    pub processed: u64,
}

impl Shard {
    fn new(id: ShardId, chain: ChainId) -> Self {
        Shard {
            id,
            chain,
            validators: Vec::new(),
            queue: VecDeque::new(),
            round_state: ShardRoundState::Idle,
            processed: 0,
        }
    }

    /// Pending work in the shard.
    pub fn load(&self) -> usize {
        self.queue.len()
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({} validators, load {}, {:?})",
            self.chain,
            self.id,
            self.validators.len(),
            self.load(),
            self.round_state
        )
    }
}

/// Transactions drained for one round, tagged with their shard of origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub chain: Option<ChainId>,
    pub items: Vec<(ShardId, String)>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn transactions(&self) -> Vec<String> {
        self.items.iter().map(|(_, tx)| tx.clone()).collect()
    }
}

/// Deterministic index-modulo partition of `validators` into `shard_count` sets.
pub fn partition(validators: &[ValidatorId], shard_count: u32) -> Vec<Vec<ValidatorId>> {
    let count = shard_count.max(1) as usize;
    let mut sorted = validators.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut sets = vec![Vec::new(); count];
    for (index, validator) in sorted.into_iter().enumerate() {
        sets[index % count].push(validator);
    }
    sets
}

fn variance(loads: &[usize]) -> f64 {
    if loads.is_empty() {
        return 0.0;
    }
    let n = loads.len() as f64;
    let mean = loads.iter().sum::<usize>() as f64 / n;
    loads.iter().map(|&l| (l as f64 - mean).powi(2)).sum::<f64>() / n
}

pub struct ShardingLayer {
    shard_count: u32,
    config: ShardingConfig,
    chains: DashMap<ChainId, Mutex<Vec<Shard>>>,
}

impl ShardingLayer {
    pub fn new(shard_count: u32, config: ShardingConfig) -> Self {
        ShardingLayer { shard_count: shard_count.max(1), config, chains: DashMap::new() }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn with_shards<R>(
        &self,
        chain: &ChainId,
        f: impl FnOnce(&mut Vec<Shard>) -> R,
    ) -> Result<R, ShardError> {
        let entry =
            self.chains.get(chain).ok_or_else(|| ShardError::UnknownChain(chain.clone()))?;
        let mut shards = entry.lock();
        Ok(f(&mut shards))
    }

    /// Partition `active` validators of `chain` into shards.
    ///
    /// Queued transactions stay in their shards. Refused mid-round.
    pub fn assign_shards(
        &self,
        chain: &ChainId,
        active: &[ValidatorId],
    ) -> Result<Vec<ShardId>, ShardError> {
        let entry = self.chains.entry(chain.clone()).or_insert_with(|| {
            let shards = (0..self.shard_count).map(|i| Shard::new(ShardId(i), chain.clone()));
            Mutex::new(shards.collect())
        });
        let mut shards = entry.lock();
        if shards.iter().any(|s| !s.round_state.is_terminal()) {
            return Err(ShardError::RoundInProgress(chain.clone()));
        }
        for (shard, validators) in shards.iter_mut().zip(partition(active, self.shard_count)) {
            shard.validators = validators;
        }
        info!(
            "[Sharding] assigned {} validators of {} across {} shards",
            active.len(),
            chain,
            shards.len()
        );
        Ok(shards.iter().map(|s| s.id).collect())
    }

    /// Queue a transaction on the least loaded shard (lowest id wins ties).
    pub fn route_transaction(
        &self,
        chain: &ChainId,
        transaction: impl Into<String>,
    ) -> Result<ShardId, ShardError> {
        let transaction = transaction.into();
        self.with_shards(chain, |shards| {
            let target = shards.iter_mut().min_by_key(|s| (s.load(), s.id))?;
            target.queue.push_back(transaction);
            Some(target.id)
        })?
        .ok_or_else(|| ShardError::UnknownChain(chain.clone()))
    }

    /// Drain up to `max` transactions, one per shard in turn.
    pub fn take_batch(&self, chain: &ChainId, max: usize) -> Result<Batch, ShardError> {
        self.with_shards(chain, |shards| {
            let mut items = Vec::new();
            while items.len() < max {
                let mut progressed = false;
                for shard in shards.iter_mut() {
                    if items.len() >= max {
                        break;
                    }
                    if let Some(tx) = shard.queue.pop_front() {
                        items.push((shard.id, tx));
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
            }
            Batch { chain: Some(chain.clone()), items }
        })
    }

    pub fn take_default_batch(&self, chain: &ChainId) -> Result<Batch, ShardError> {
        self.take_batch(chain, self.config.batch_size)
    }

    /// Put a batch back at the front of its shards, preserving order.
    pub fn requeue(&self, chain: &ChainId, batch: Batch) -> Result<(), ShardError> {
        self.with_shards(chain, |shards| {
            for (shard_id, tx) in batch.items.into_iter().rev() {
                let index = shards
                    .iter()
                    .position(|s| s.id == shard_id)
                    .unwrap_or(0);
                if let Some(shard) = shards.get_mut(index) {
                    shard.queue.push_front(tx);
                }
            }
        })
    }

    /// Count a committed batch toward its shards' processed totals.
    pub fn record_processed(&self, chain: &ChainId, batch: &Batch) -> Result<(), ShardError> {
        self.with_shards(chain, |shards| {
            for (shard_id, _) in &batch.items {
                if let Some(shard) = shards.iter_mut().find(|s| s.id == *shard_id) {
                    shard.processed += 1;
                }
            }
        })
    }

    pub fn begin_round(&self, chain: &ChainId) -> Result<(), ShardError> {
        self.with_shards(chain, |shards| {
            if shards.iter().any(|s| !s.round_state.is_terminal()) {
                return Err(ShardError::RoundInProgress(chain.clone()));
            }
            for shard in shards.iter_mut() {
                shard.round_state = ShardRoundState::Open;
            }
            Ok(())
        })?
    }

    pub fn end_round(&self, chain: &ChainId, committed: bool) -> Result<(), ShardError> {
        let state = if committed { ShardRoundState::Committed } else { ShardRoundState::Failed };
        self.with_shards(chain, |shards| {
            if shards.iter().all(|s| s.round_state.is_terminal()) {
                return Err(ShardError::NoOpenRound(chain.clone()));
            }
            for shard in shards.iter_mut() {
                shard.round_state = state;
            }
            Ok(())
        })?
    }

    /// Population variance of shard queue lengths.
    pub fn load_variance(&self, chain: &ChainId) -> Result<f64, ShardError> {
        self.with_shards(chain, |shards| {
            let loads: Vec<usize> = shards.iter().map(Shard::load).collect();
            variance(&loads)
        })
    }

    /// Re-partition validators and spread queued work evenly across shards.
    pub fn rebalance(&self, chain: &ChainId) -> Result<(), ShardError> {
        self.with_shards(chain, |shards| {
            if shards.iter().any(|s| !s.round_state.is_terminal()) {
                return Err(ShardError::RoundInProgress(chain.clone()));
            }

            let validators: Vec<ValidatorId> =
                shards.iter().flat_map(|s| s.validators.iter().cloned()).collect();
            let shard_total = shards.len() as u32;
            for (shard, set) in shards.iter_mut().zip(partition(&validators, shard_total)) {
                shard.validators = set;
            }

            // interleave so that older work stays near the front
            let mut pending = Vec::new();
            loop {
                let mut progressed = false;
                for shard in shards.iter_mut() {
                    if let Some(tx) = shard.queue.pop_front() {
                        pending.push(tx);
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
            }
            let count = shards.len().max(1);
            for (index, tx) in pending.into_iter().enumerate() {
                shards[index % count].queue.push_back(tx);
            }
            info!("[Sharding] rebalanced {}", chain);
            Ok(())
        })?
    }

    /// Rebalance when load variance exceeds the configured threshold.
    ///
    /// Returns whether a rebalance happened. Mid-round it waits for the next call.
    pub fn maybe_rebalance(&self, chain: &ChainId) -> Result<bool, ShardError> {
        let variance = self.load_variance(chain)?;
        if variance <= self.config.load_variance_threshold {
            return Ok(false);
        }
        match self.rebalance(chain) {
            Ok(()) => Ok(true),
            Err(ShardError::RoundInProgress(_)) => {
                debug!(
                    "[Sharding] {} variance {:.1} over threshold, deferring until round ends",
                    chain, variance
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn shards(&self, chain: &ChainId) -> Vec<Shard> {
        self.with_shards(chain, |shards| shards.clone()).unwrap_or_default()
    }

    /// Shard a validator is listed under. Audit only; rounds do not consult it.
    pub fn shard_of(&self, chain: &ChainId, validator: &ValidatorId) -> Option<ShardId> {
        self.with_shards(chain, |shards| {
            shards.iter().find(|s| s.validators.contains(validator)).map(|s| s.id)
        })
        .ok()
        .flatten()
    }

    pub fn pending(&self, chain: &ChainId) -> usize {
        self.with_shards(chain, |shards| shards.iter().map(Shard::load).sum()).unwrap_or(0)
    }
}
