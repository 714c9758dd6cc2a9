// CLUSTER METRICS
// Rolling-window aggregates recomputed every monitoring cycle. Never
// persisted as authoritative state.

use chrono::{DateTime, Utc};
use guard_core::{ChainId, ChainNode, SyncStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Health of one chain at sampling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainHealth {
    pub chain: ChainId,
    pub status: SyncStatus,
    pub height: u64,
    pub degraded: bool,
    pub endpoint: Option<String>,
}

impl From<&ChainNode> for ChainHealth {
    fn from(node: &ChainNode) -> Self {
        ChainHealth {
            chain: node.chain_id.clone(),
            status: node.status,
            height: node.height,
            degraded: node.degraded,
            endpoint: node.current_endpoint().map(str::to_string),
        }
    }
}

/// Raw counts gathered during one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSample {
    pub elapsed_secs: f64,
    pub committed_rounds: u64,
    pub failed_rounds: u64,
    pub transactions: u64,
    pub latency_sum_ms: u64,
}

impl CycleSample {
    pub fn rounds(&self) -> u64 {
        self.committed_rounds + self.failed_rounds
    }

    pub fn merge(&mut self, other: &CycleSample) {
        self.committed_rounds += other.committed_rounds;
        self.failed_rounds += other.failed_rounds;
        self.transactions += other.transactions;
        self.latency_sum_ms += other.latency_sum_ms;
    }
}

/// Fixed-capacity window of the most recent cycle samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<CycleSample>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        RollingWindow { capacity: capacity.max(1), samples: VecDeque::new() }
    }

    pub fn push(&mut self, sample: CycleSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sum of every sample in the window.
    pub fn total(&self) -> CycleSample {
        let mut total = CycleSample::default();
        for sample in &self.samples {
            total.merge(sample);
            total.elapsed_secs += sample.elapsed_secs;
        }
        total
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub cycle: u64,
    pub sampled_at: DateTime<Utc>,
    /// Committed transactions per second over the window
    pub throughput: f64,
    /// Mean round latency over the window; 0 when no rounds ran
    pub avg_latency_ms: f64,
    /// Committed / total rounds over the window; 0 when no rounds ran
    pub success_rate: f64,
    pub rounds: u64,
    pub chains: Vec<ChainHealth>,
    /// Unreachable chains left out of every aggregate above
    pub excluded_chains: Vec<ChainId>,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub validators_slashed: u64,
}

impl ClusterMetrics {
    pub fn from_window(window: &RollingWindow) -> (f64, f64, f64, u64) {
        let total = window.total();
        let rounds = total.rounds();
        let throughput = if total.elapsed_secs > 0.0 {
            total.transactions as f64 / total.elapsed_secs
        } else {
            0.0
        };
        let (latency, success) = if rounds > 0 {
            let rounds = rounds as f64;
            (total.latency_sum_ms as f64 / rounds, total.committed_rounds as f64 / rounds)
        } else {
            (0.0, 0.0)
        };
        (throughput, latency, success, rounds)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
