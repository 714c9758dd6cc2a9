// PER-CHAIN CONSENSUS ENGINE
// Runs quorum rounds for one chain over the shared validator registry.
//
// SAFETY INVARIANTS:
// 1. Rounds for a chain are strictly sequential: round N+1 cannot open until
//    round N is Committed or Failed
// 2. Round numbers increase by exactly one per terminal round
// 3. Reputation and slashing are applied only after the round is terminal
// 4. A slow or failing attestation becomes an invalid vote, never a stuck round
// 5. Engines for different chains share nothing but the registry and bus
// 6. A ledger failure during attestation aborts the round; no validator is
//    charged for it

use crate::attestation::{Attestation, AttestationError, Attestor, Proposal};
use crate::consensus::{ConsensusRound, RoundOutcome, Vote};
use crate::slashing_engine::{SlashingEngine, SlashingEvent};
use crate::validator_registry::ValidatorRegistry;
use futures::future::join_all;
use guard_core::{
    ChainId, ClusterConfig, ClusterEvent, EventBus, ReputationConfig, ValidatorId, VotePayload,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Previous round has not reached a terminal state
    RoundInProgress { chain: ChainId, round: u64 },
    NoOpenRound { chain: ChainId },
    RoundMismatch { expected: u64, got: u64 },
    /// Validator was not in the active set when the round opened
    NotEligible { validator: ValidatorId, round: u64 },
    DuplicateVote { validator: ValidatorId, round: u64 },
    RoundClosed { chain: ChainId, round: u64 },
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::RoundInProgress { chain, round } => {
                write!(f, "Round {} on {} has not reached a terminal state", round, chain)
            }
            ConsensusError::NoOpenRound { chain } => write!(f, "No open round on {}", chain),
            ConsensusError::RoundMismatch { expected, got } => {
                write!(f, "Round mismatch: expected {}, got {}", expected, got)
            }
            ConsensusError::NotEligible { validator, round } => {
                write!(f, "Validator {} is not eligible in round {}", validator, round)
            }
            ConsensusError::DuplicateVote { validator, round } => {
                write!(f, "Validator {} already voted in round {}", validator, round)
            }
            ConsensusError::RoundClosed { chain, round } => {
                write!(f, "Round {} on {} no longer accepts votes", round, chain)
            }
        }
    }
}

impl std::error::Error for ConsensusError {}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub threshold: f64,
    pub reputation: ReputationConfig,
    pub attestation_timeout: Duration,
    pub history_limit: usize,
}

impl EngineConfig {
    pub fn from_cluster(config: &ClusterConfig) -> Self {
        EngineConfig {
            threshold: config.consensus_threshold,
            reputation: config.reputation.clone(),
            attestation_timeout: config.timing.failover_budget(config.max_endpoints()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoundResult {
    pub chain: ChainId,
    pub round: u64,
    pub height: u64,
    pub outcome: RoundOutcome,
    pub positive_votes: usize,
    pub total_votes: usize,
    pub transactions: usize,
    pub latency: Duration,
    pub slashed: Vec<SlashingEvent>,
    pub payload: VotePayload,
}

impl RoundResult {
    pub fn committed(&self) -> bool {
        self.outcome == RoundOutcome::Committed
    }
}

struct EngineState {
    next_round: u64,
    current: Option<ConsensusRound>,
    history: VecDeque<ConsensusRound>,
}

pub struct ConsensusEngine {
    chain: ChainId,
    config: EngineConfig,
    registry: Arc<ValidatorRegistry>,
    slashing: Arc<SlashingEngine>,
    bus: EventBus,
    state: Mutex<EngineState>,
    /// Serializes `run_round` calls for this chain
    sequencer: tokio::sync::Mutex<()>,
}

impl ConsensusEngine {
    pub fn new(
        chain: ChainId,
        config: EngineConfig,
        registry: Arc<ValidatorRegistry>,
        slashing: Arc<SlashingEngine>,
        bus: EventBus,
    ) -> Self {
        ConsensusEngine {
            chain,
            config,
            registry,
            slashing,
            bus,
            state: Mutex::new(EngineState {
                next_round: 1,
                current: None,
                history: VecDeque::new(),
            }),
            sequencer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    pub fn next_round(&self) -> u64 {
        self.state.lock().next_round
    }

    pub fn current_round(&self) -> Option<ConsensusRound> {
        self.state.lock().current.clone()
    }

    /// Open the next round over the chain's current active set.
    pub fn open_round(
        &self,
        height: u64,
        transactions: Vec<String>,
    ) -> Result<Proposal, ConsensusError> {
        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            return Err(ConsensusError::RoundInProgress {
                chain: self.chain.clone(),
                round: current.round,
            });
        }
        let proposal = Proposal::new(self.chain.clone(), state.next_round, height, transactions);
        let eligible = self.registry.active_ids(&self.chain);
        let round = ConsensusRound::open(&proposal, eligible);
        debug!("[Consensus] opened {} with {} eligible validators", round, round.total_votes());
        state.current = Some(round);
        Ok(proposal)
    }

    pub fn record_vote(
        &self,
        round: u64,
        validator: ValidatorId,
        vote: Vote,
    ) -> Result<(), ConsensusError> {
        let mut state = self.state.lock();
        let current = state
            .current
            .as_mut()
            .ok_or_else(|| ConsensusError::NoOpenRound { chain: self.chain.clone() })?;
        if current.round != round {
            return Err(ConsensusError::RoundMismatch { expected: current.round, got: round });
        }
        current.cast(validator, vote)
    }

    /// Close the open round, then apply reputation and publish the outcome.
    pub fn tally_round(&self) -> Result<RoundResult, ConsensusError> {
        self.finish_round(false)
    }

    /// Close the open round as `LedgerUnavailable`, leaving reputations alone.
    pub fn abort_round(&self) -> Result<RoundResult, ConsensusError> {
        self.finish_round(true)
    }

    fn finish_round(&self, abort: bool) -> Result<RoundResult, ConsensusError> {
        let round = {
            let mut state = self.state.lock();
            let mut round = state
                .current
                .take()
                .ok_or_else(|| ConsensusError::NoOpenRound { chain: self.chain.clone() })?;
            round.begin_tally()?;
            if abort {
                round.abort();
            } else {
                round.close(self.config.threshold);
            }
            state.next_round += 1;
            round
        };

        let slashed = self
            .registry
            .apply_round_result(&round, self.config.reputation.commit_reward, &self.slashing);

        let latency = round
            .closed_at
            .and_then(|closed| (closed - round.opened_at).to_std().ok())
            .unwrap_or_default();
        let latency_ms = latency.as_millis() as u64;

        match round.outcome() {
            RoundOutcome::Committed => {
                info!("[Consensus] {} committed in {}ms", round, latency_ms);
                self.bus.publish(ClusterEvent::ConsensusSuccess {
                    chain: self.chain.clone(),
                    round: round.round,
                    positive_votes: round.positive_votes(),
                    total_votes: round.total_votes(),
                    latency_ms,
                    transactions: round.transactions,
                });
            }
            RoundOutcome::Failed(reason) => {
                warn!("[Consensus] {} failed: {:?}", round, reason);
                self.bus.publish(ClusterEvent::ConsensusFailure {
                    chain: self.chain.clone(),
                    round: round.round,
                    reason,
                    positive_votes: round.positive_votes(),
                    total_votes: round.total_votes(),
                    latency_ms,
                });
            }
            RoundOutcome::Open | RoundOutcome::Tallying => {}
        }

        for event in &slashed {
            self.bus.publish(ClusterEvent::ValidatorSlashed {
                validator: event.validator.clone(),
                chain: event.chain.clone(),
                consecutive_failures: event.consecutive_failures,
            });
        }

        let result = RoundResult {
            chain: self.chain.clone(),
            round: round.round,
            height: round.height,
            outcome: round.outcome(),
            positive_votes: round.positive_votes(),
            total_votes: round.total_votes(),
            transactions: round.transactions,
            latency,
            slashed,
            payload: round.to_payload(),
        };

        let mut state = self.state.lock();
        state.history.push_back(round);
        while state.history.len() > self.config.history_limit.max(1) {
            state.history.pop_front();
        }
        Ok(result)
    }

    /// Run one complete round: open, gather attestations concurrently, tally.
    pub async fn run_round(
        &self,
        height: u64,
        transactions: Vec<String>,
        attestor: &dyn Attestor,
    ) -> Result<RoundResult, ConsensusError> {
        let _sequence = self.sequencer.lock().await;
        let proposal = self.open_round(height, transactions)?;

        let eligible: Vec<ValidatorId> = self
            .current_round()
            .map(|round| round.eligible().to_vec())
            .unwrap_or_default();
        let validators: Vec<_> = eligible.iter().filter_map(|id| self.registry.get(id)).collect();

        let timeout = self.config.attestation_timeout;
        let attestations = join_all(validators.iter().map(|validator| {
            let proposal = &proposal;
            async move {
                let attested =
                    tokio::time::timeout(timeout, attestor.attest(validator, proposal)).await;
                let verdict = match attested {
                    Ok(result) => result,
                    Err(_) => Err(AttestationError::Timeout(timeout.as_millis() as u64)),
                };
                (validator.id.clone(), verdict)
            }
        }))
        .await;

        let mut ledger_failure = None;
        for (validator, verdict) in attestations {
            let attestation = match verdict {
                Ok(attestation) => attestation,
                Err(AttestationError::Ledger(e)) => {
                    ledger_failure.get_or_insert(e);
                    continue;
                }
                Err(e) => {
                    debug!(
                        "[Consensus] {} counted invalid in round {}: {}",
                        validator, proposal.round, e
                    );
                    Attestation::invalid()
                }
            };
            let vote = Vote { valid: attestation.valid, signature_ref: attestation.signature_ref };
            if let Err(e) = self.record_vote(proposal.round, validator, vote) {
                warn!("[Consensus] dropped vote: {}", e);
            }
        }

        if let Some(e) = ledger_failure {
            warn!(
                "[Consensus] ledger of {} failed during round {}, aborting: {}",
                self.chain, proposal.round, e
            );
            return self.abort_round();
        }
        self.tally_round()
    }

    /// Terminal rounds, oldest first.
    pub fn history(&self) -> Vec<ConsensusRound> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn round(&self, number: u64) -> Option<ConsensusRound> {
        self.state.lock().history.iter().find(|r| r.round == number).cloned()
    }
}
