use async_trait::async_trait;
use guard_consensus::{
    Attestation, AttestationError, Attestor, ConsensusEngine, EngineConfig, Proposal, RoundOutcome,
    SlashingEngine, ValidatorRegistry,
};
use guard_core::{
    ChainId, ClusterEvent, EventBus, ReputationConfig, RoundFailureReason, Validator, ValidatorId,
    MAX_REPUTATION, MIN_REPUTATION,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Votes valid only for the listed validators.
struct Approves(HashSet<ValidatorId>);

#[async_trait]
impl Attestor for Approves {
    async fn attest(
        &self,
        validator: &Validator,
        proposal: &Proposal,
    ) -> Result<Attestation, AttestationError> {
        if self.0.contains(&validator.id) {
            Ok(Attestation::valid(format!("{}:{}", validator.id, proposal.digest)))
        } else {
            Ok(Attestation::invalid())
        }
    }
}

/// Never answers.
struct Silent;

#[async_trait]
impl Attestor for Silent {
    async fn attest(&self, _: &Validator, _: &Proposal) -> Result<Attestation, AttestationError> {
        std::future::pending().await
    }
}

fn setup(
    count: usize,
    threshold: f64,
    failure_window: u32,
) -> (ConsensusEngine, Arc<ValidatorRegistry>, EventBus) {
    let registry = Arc::new(ValidatorRegistry::new());
    for i in 1..=count {
        registry
            .register(Validator::new(
                ValidatorId::new(format!("v{}", i)),
                ChainId::new("alpha"),
                [i as u8; 32],
                50.0,
                false,
            ))
            .unwrap();
    }
    let reputation = ReputationConfig { failure_window, ..ReputationConfig::default() };
    let slashing = Arc::new(SlashingEngine::from_config(&reputation));
    let bus = EventBus::new();
    let config = EngineConfig {
        threshold,
        reputation,
        attestation_timeout: Duration::from_millis(200),
        history_limit: 16,
    };
    let chain = ChainId::new("alpha");
    let engine = ConsensusEngine::new(chain, config, registry.clone(), slashing, bus.clone());
    (engine, registry, bus)
}

fn approving(ids: &[usize]) -> Approves {
    Approves(ids.iter().map(|i| ValidatorId::new(format!("v{}", i))).collect())
}

#[tokio::test]
async fn four_of_five_commits_at_067() {
    let (engine, _, bus) = setup(5, 0.67, 5);
    let mut events = bus.subscribe();

    let result = engine.run_round(100, vec![], &approving(&[1, 2, 3, 4])).await.unwrap();

    assert_eq!(result.outcome, RoundOutcome::Committed);
    assert_eq!((result.positive_votes, result.total_votes), (4, 5));
    assert!(matches!(
        events.recv().await.unwrap(),
        ClusterEvent::ConsensusSuccess { round: 1, .. }
    ));
}

#[tokio::test]
async fn three_of_five_fails_at_067() {
    let (engine, registry, bus) = setup(5, 0.67, 5);
    let mut events = bus.subscribe();

    let result = engine.run_round(100, vec![], &approving(&[1, 2, 3])).await.unwrap();

    assert_eq!(result.outcome, RoundOutcome::Failed(RoundFailureReason::QuorumNotReached));
    assert!(matches!(
        events.recv().await.unwrap(),
        ClusterEvent::ConsensusFailure { reason: RoundFailureReason::QuorumNotReached, .. }
    ));
    // failed rounds do not reward
    assert_eq!(registry.get(&ValidatorId::new("v1")).unwrap().reputation(), 50.0);
}

#[tokio::test(start_paused = true)]
async fn silent_validators_time_out_as_invalid_votes() {
    let (engine, registry, _) = setup(3, 0.5, 2);

    let first = engine.run_round(1, vec![], &Silent).await.unwrap();
    assert_eq!(first.outcome, RoundOutcome::Failed(RoundFailureReason::QuorumNotReached));
    assert!(first.slashed.is_empty());

    let second = engine.run_round(2, vec![], &Silent).await.unwrap();
    assert_eq!(second.slashed.len(), 3);
    assert!(registry.active_ids(&ChainId::new("alpha")).is_empty());

    let third = engine.run_round(3, vec![], &Silent).await.unwrap();
    assert_eq!(third.outcome, RoundOutcome::Failed(RoundFailureReason::NoQuorumPossible));
}

#[tokio::test]
async fn a_valid_vote_resets_the_failure_streak() {
    let (engine, registry, _) = setup(2, 0.5, 2);
    let v2 = ValidatorId::new("v2");

    engine.run_round(1, vec![], &approving(&[1])).await.unwrap();
    assert_eq!(registry.get(&v2).unwrap().consecutive_failures, 1);
    engine.run_round(2, vec![], &approving(&[1, 2])).await.unwrap();
    assert_eq!(registry.get(&v2).unwrap().consecutive_failures, 0);
    engine.run_round(3, vec![], &approving(&[1])).await.unwrap();
    assert!(registry.get(&v2).unwrap().is_active());
}

#[tokio::test]
async fn rounds_are_numbered_sequentially() {
    let (engine, _, _) = setup(3, 0.67, 5);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..6)
        .map(|h| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_round(h, vec![], &approving(&[1, 2, 3])).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let rounds: Vec<u64> = engine.history().iter().map(|r| r.round).collect();
    assert_eq!(rounds, vec![1, 2, 3, 4, 5, 6]);
}

proptest! {
    #[test]
    fn reputation_stays_bounded(
        approvals in proptest::collection::vec(proptest::collection::vec(any::<bool>(), 4), 1..40)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (engine, registry, _) = setup(4, 0.5, 3);

        runtime.block_on(async {
            for (height, votes) in approvals.iter().enumerate() {
                let ids: Vec<usize> =
                    votes.iter().enumerate().filter(|(_, v)| **v).map(|(i, _)| i + 1).collect();
                engine.run_round(height as u64, vec![], &approving(&ids)).await.unwrap();
            }
        });

        for validator in registry.snapshot() {
            prop_assert!(validator.reputation() >= MIN_REPUTATION);
            prop_assert!(validator.reputation() <= MAX_REPUTATION);
        }
    }
}
