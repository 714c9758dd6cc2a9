// CLUSTER MONITOR
// Passive observer: folds bus events into per-chain counters and turns
// them into ClusterMetrics once per monitoring cycle.
//
// SAFETY INVARIANTS:
// 1. The monitor never mutates another component; it only reads snapshots
// 2. Unreachable chains are excluded from every global aggregate
// 3. Counters of a cycle are consumed exactly once by `sample`

use crate::metrics::{ChainHealth, ClusterMetrics, CycleSample, RollingWindow};
use chrono::Utc;
use guard_core::{ChainId, ChainNode, ClusterEvent, EventSink};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Default)]
struct Totals {
    transfers_completed: u64,
    transfers_failed: u64,
    validators_slashed: u64,
}

struct MonitorState {
    cycle: u64,
    pending: HashMap<ChainId, CycleSample>,
    window: RollingWindow,
    totals: Totals,
    latest: Option<ClusterMetrics>,
}

pub struct ClusterMonitor {
    state: Mutex<MonitorState>,
}

impl ClusterMonitor {
    /// `window` is the number of cycles kept in the rolling aggregates.
    pub fn new(window: usize) -> Self {
        ClusterMonitor {
            state: Mutex::new(MonitorState {
                cycle: 0,
                pending: HashMap::new(),
                window: RollingWindow::new(window),
                totals: Totals::default(),
                latest: None,
            }),
        }
    }

    pub fn observe(&self, event: &ClusterEvent) {
        let mut state = self.state.lock();
        match event {
            ClusterEvent::ConsensusSuccess { chain, latency_ms, transactions, .. } => {
                let counters = state.pending.entry(chain.clone()).or_default();
                counters.committed_rounds += 1;
                counters.transactions += *transactions as u64;
                counters.latency_sum_ms += latency_ms;
            }
            ClusterEvent::ConsensusFailure { chain, latency_ms, .. } => {
                let counters = state.pending.entry(chain.clone()).or_default();
                counters.failed_rounds += 1;
                counters.latency_sum_ms += latency_ms;
            }
            ClusterEvent::TransferCompleted { .. } => state.totals.transfers_completed += 1,
            ClusterEvent::TransferFailed { .. } => state.totals.transfers_failed += 1,
            ClusterEvent::ValidatorSlashed { .. } => state.totals.validators_slashed += 1,
            _ => {}
        }
    }

    /// Close the current cycle.
    ///
    /// `chains` is a snapshot from the connection manager and `elapsed` the
    /// wall time the cycle covered. Counters attributed to chains that are
    /// unreachable at sampling time are discarded.
    pub fn sample(&self, chains: &[ChainNode], elapsed: Duration) -> ClusterMetrics {
        let mut state = self.state.lock();
        state.cycle += 1;

        let mut cycle =
            CycleSample { elapsed_secs: elapsed.as_secs_f64(), ..CycleSample::default() };
        let mut health = Vec::new();
        let mut excluded = Vec::new();
        let pending = std::mem::take(&mut state.pending);

        for node in chains {
            if !node.is_reachable() {
                excluded.push(node.chain_id.clone());
                continue;
            }
            if let Some(counters) = pending.get(&node.chain_id) {
                cycle.merge(counters);
            }
            health.push(ChainHealth::from(node));
        }
        state.window.push(cycle);

        let (throughput, avg_latency_ms, success_rate, rounds) =
            ClusterMetrics::from_window(&state.window);
        let metrics = ClusterMetrics {
            cycle: state.cycle,
            sampled_at: Utc::now(),
            throughput,
            avg_latency_ms,
            success_rate,
            rounds,
            chains: health,
            excluded_chains: excluded,
            transfers_completed: state.totals.transfers_completed,
            transfers_failed: state.totals.transfers_failed,
            validators_slashed: state.totals.validators_slashed,
        };

        if !metrics.excluded_chains.is_empty() {
            info!(
                "[Monitor] cycle {} excludes unreachable chains {:?}",
                metrics.cycle, metrics.excluded_chains
            );
        }
        debug!("[Monitor] {}", metrics.to_json());
        state.latest = Some(metrics.clone());
        metrics
    }

    pub fn latest(&self) -> Option<ClusterMetrics> {
        self.state.lock().latest.clone()
    }
}

impl EventSink for ClusterMonitor {
    fn on_event(&self, event: &ClusterEvent) {
        self.observe(event);
    }
}
