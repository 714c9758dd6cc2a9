//! Typed cluster events and the publish/subscribe bus that carries them.
//!
//! Components publish; the cluster monitor and external dashboards subscribe.
//! Publishing never blocks and never fails: a bus with no subscribers simply
//! drops the event after logging it.

use crate::types::{ChainId, TransferId, ValidatorId};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundFailureReason {
    /// positive / total fell below the consensus threshold
    QuorumNotReached,
    /// No votes were cast at all
    NoQuorumPossible,
    /// The chain's ledger could not be read while gathering attestations;
    /// the round is aborted and no validator is charged
    LedgerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFailure {
    Expired,
    SignatureRejected { validator: ValidatorId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterEvent {
    ConsensusSuccess {
        chain: ChainId,
        round: u64,
        positive_votes: usize,
        total_votes: usize,
        latency_ms: u64,
        transactions: usize,
    },
    ConsensusFailure {
        chain: ChainId,
        round: u64,
        reason: RoundFailureReason,
        positive_votes: usize,
        total_votes: usize,
        latency_ms: u64,
    },
    TransferConfirmed {
        transfer: TransferId,
        signatures: usize,
    },
    TransferCompleted {
        transfer: TransferId,
        source: ChainId,
        destination: ChainId,
        asset: String,
        amount: u64,
    },
    TransferFailed {
        transfer: TransferId,
        reason: TransferFailure,
    },
    ChainDegraded {
        chain: ChainId,
        fallback_endpoint: String,
    },
    ChainUnreachable {
        chain: ChainId,
    },
    ChainRecovered {
        chain: ChainId,
    },
    ValidatorSlashed {
        validator: ValidatorId,
        chain: ChainId,
        consecutive_failures: u32,
    },
    ScaleIntent {
        direction: ScaleDirection,
        reason: String,
    },
}

impl ClusterEvent {
    /// Topic name as seen by external subscribers.
    pub fn topic(&self) -> &'static str {
        match self {
            ClusterEvent::ConsensusSuccess { .. } => "consensus.success",
            ClusterEvent::ConsensusFailure { .. } => "consensus.failure",
            ClusterEvent::TransferConfirmed { .. } => "bridge.transfer_confirmed",
            ClusterEvent::TransferCompleted { .. } => "bridge.transfer_completed",
            ClusterEvent::TransferFailed { .. } => "bridge.transfer_failed",
            ClusterEvent::ChainDegraded { .. } => "chain.degraded",
            ClusterEvent::ChainUnreachable { .. } => "chain.unreachable",
            ClusterEvent::ChainRecovered { .. } => "chain.recovered",
            ClusterEvent::ValidatorSlashed { .. } => "validator.slashed",
            ClusterEvent::ScaleIntent { .. } => "cluster.scale_intent",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ClusterEvent::ConsensusFailure { .. }
                | ClusterEvent::TransferFailed { .. }
                | ClusterEvent::ChainDegraded { .. }
                | ClusterEvent::ChainUnreachable { .. }
                | ClusterEvent::ValidatorSlashed { .. }
        )
    }
}

/// Synchronous subscriber interface for dashboards and orchestrators.
pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, event: &ClusterEvent);
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    /// Publish an event. Returns how many subscribers received it.
    pub fn publish(&self, event: ClusterEvent) -> usize {
        if event.is_failure() {
            warn!("[EventBus] {}: {:?}", event.topic(), event);
        } else {
            info!("[EventBus] {}: {:?}", event.topic(), event);
        }
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    /// Forward every subsequent event to `sink` on a background task.
    ///
    /// The task ends when the bus is dropped. A sink that falls behind skips
    /// the events it missed.
    pub fn attach(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => sink.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[EventBus] subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector(Mutex<Vec<String>>);

    impl EventSink for Collector {
        fn on_event(&self, event: &ClusterEvent) {
            self.0.lock().push(event.topic().to_string());
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        let delivered =
            bus.publish(ClusterEvent::ChainUnreachable { chain: ChainId::new("alpha") });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ClusterEvent::ChainDegraded {
            chain: ChainId::new("alpha"),
            fallback_endpoint: "http://fb".to_string(),
        });
        bus.publish(ClusterEvent::ScaleIntent {
            direction: ScaleDirection::Up,
            reason: "latency".to_string(),
        });

        assert_eq!(rx.recv().await.unwrap().topic(), "chain.degraded");
        assert_eq!(rx.recv().await.unwrap().topic(), "cluster.scale_intent");
    }

    #[tokio::test]
    async fn test_attached_sink_sees_events() {
        let bus = EventBus::new();
        let sink = Arc::new(Collector::default());
        let handle = bus.attach(sink.clone());

        bus.publish(ClusterEvent::ChainRecovered { chain: ChainId::new("alpha") });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(*sink.0.lock(), vec!["chain.recovered".to_string()]);
    }
}
