use ed25519_dalek::SigningKey;
use guard_consensus::RoundOutcome;
use guard_core::ledger::memory::{EndpointMode, InMemoryLedgerNetwork};
use guard_core::{
    ChainId, ClusterConfig, ClusterEvent, RoundFailureReason, SyncStatus, TransferStatus,
    ValidatorId,
};
use guard_interop::{sign_transfer, BridgeError, LedgerHeightAttestor};
use guard_scheduler::Cluster;
use guard_state::{MemoryStore, StateStore};
use std::sync::Arc;
use std::time::Duration;

fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

fn config() -> ClusterConfig {
    let mut raw = String::from(
        r#"
shard_count = 2
consensus_threshold = 0.67
bridge_signature_threshold = 3
max_transfer_amount = 1000

[timing]
call_timeout_ms = 100
health_interval_ms = 1000
consensus_interval_ms = 1000
sweep_interval_ms = 1000
metrics_interval_ms = 2000
transfer_deadline_secs = 600

[[supported_chains]]
name = "chainA"
endpoints = ["mem://a1", "mem://a2"]

[[supported_chains]]
name = "chainB"
endpoints = ["mem://b1"]
"#,
    );
    for i in 0..5u8 {
        raw.push_str(&format!(
            concat!(
                "\n[[validators]]\nid = \"a{}\"\nchain = \"chainA\"\n",
                "public_key = \"{}\"\nbridge = {}\n"
            ),
            i,
            hex::encode(key(i + 1).verifying_key().to_bytes()),
            i < 3
        ));
    }
    for i in 0..2u8 {
        raw.push_str(&format!(
            "\n[[validators]]\nid = \"b{}\"\nchain = \"chainB\"\npublic_key = \"{}\"\n",
            i,
            hex::encode(key(i + 20).verifying_key().to_bytes())
        ));
    }
    ClusterConfig::from_toml_str(&raw).unwrap()
}

fn cluster(network: &InMemoryLedgerNetwork, store: Arc<MemoryStore>) -> Arc<Cluster> {
    Cluster::bootstrap(config(), Arc::new(network.clone()), store).unwrap()
}

#[tokio::test]
async fn unanimous_round_commits_batch_and_broadcasts_vote() {
    let network = InMemoryLedgerNetwork::new();
    let chain = ChainId::new("chainA");
    network.set_height(&chain, 12);
    let cluster = cluster(&network, Arc::new(MemoryStore::new()));

    for i in 0..3 {
        cluster.submit_transaction(&chain, format!("tx{}", i)).unwrap();
    }
    let result = cluster.consensus_cycle(&chain).await.unwrap().unwrap();

    assert!(result.committed());
    assert_eq!((result.positive_votes, result.total_votes, result.transactions), (5, 5, 3));
    assert_eq!(cluster.sharding().pending(&chain), 0);
    assert_eq!(cluster.registry().get(&ValidatorId::new("a0")).unwrap().reputation(), 51.0);

    let votes = network.votes();
    assert_eq!(votes.len(), 1);
    assert!(votes[0].committed);
    assert_eq!(votes[0].height, 12);
}

#[tokio::test]
async fn unreachable_chain_is_isolated() {
    let network = InMemoryLedgerNetwork::new();
    network.set_mode("mem://b1", EndpointMode::Down);
    let cluster = cluster(&network, Arc::new(MemoryStore::new()));
    let (a, b) = (ChainId::new("chainA"), ChainId::new("chainB"));

    assert!(cluster.consensus_cycle(&b).await.unwrap().is_none());
    assert_eq!(cluster.chains().chain_node(&b).unwrap().status, SyncStatus::Unreachable);
    assert!(cluster.consensus_cycle(&a).await.unwrap().unwrap().committed());

    // validators of the dead chain are not punished for the outage
    let b0 = cluster.registry().get(&ValidatorId::new("b0")).unwrap();
    assert_eq!((b0.reputation(), b0.consecutive_failures), (50.0, 0));
    assert!(cluster.engine(&b).unwrap().history().is_empty());

    let metrics = cluster.metrics_cycle();
    assert_eq!(metrics.excluded_chains, vec![b.clone()]);
    assert_eq!(metrics.chains.len(), 1);

    network.set_mode("mem://b1", EndpointMode::Up);
    assert_eq!(cluster.health_cycle(&b).await.unwrap(), SyncStatus::Syncing);
    assert!(cluster.consensus_cycle(&b).await.unwrap().unwrap().committed());
}

#[tokio::test]
async fn failover_keeps_consensus_running() {
    let network = InMemoryLedgerNetwork::new();
    network.set_mode("mem://a1", EndpointMode::Stalled);
    let cluster = cluster(&network, Arc::new(MemoryStore::new()));
    let chain = ChainId::new("chainA");
    let mut events = cluster.bus().subscribe();

    let result = cluster.consensus_cycle(&chain).await.unwrap().unwrap();
    assert!(result.committed());
    assert_eq!(cluster.chains().active_endpoint(&chain).unwrap(), "mem://a2");
    assert!(matches!(events.try_recv(), Ok(ClusterEvent::ConsensusSuccess { .. })));
}

#[tokio::test(start_paused = true)]
async fn endpoint_stalling_during_attestation_charges_nobody() {
    let network = InMemoryLedgerNetwork::new();
    let chain = ChainId::new("chainA");
    network.set_height(&chain, 5);
    let cluster = cluster(&network, Arc::new(MemoryStore::new()));
    network.set_mode("mem://a1", EndpointMode::Stalled);

    let attestor = LedgerHeightAttestor::new(cluster.chains().clone());
    let engine = cluster.engine(&chain).unwrap();
    let result = engine.run_round(5, vec!["tx".into()], &attestor).await.unwrap();

    assert!(result.committed());
    assert_eq!((result.positive_votes, result.total_votes), (5, 5));
    assert_eq!(cluster.chains().active_endpoint(&chain).unwrap(), "mem://a2");
    for id in cluster.registry().active_ids(&chain) {
        assert_eq!(cluster.registry().get(&id).unwrap().consecutive_failures, 0);
    }
}

#[tokio::test]
async fn ledger_lost_during_attestation_aborts_round_without_slashing() {
    let network = InMemoryLedgerNetwork::new();
    let chain = ChainId::new("chainA");
    let cluster = cluster(&network, Arc::new(MemoryStore::new()));
    network.set_mode("mem://a1", EndpointMode::Down);
    network.set_mode("mem://a2", EndpointMode::Down);

    let attestor = LedgerHeightAttestor::new(cluster.chains().clone());
    let engine = cluster.engine(&chain).unwrap();
    let window = cluster.config().reputation.failure_window as u64;
    for height in 0..=window {
        let result = engine.run_round(height, vec![], &attestor).await.unwrap();
        assert_eq!(result.outcome, RoundOutcome::Failed(RoundFailureReason::LedgerUnavailable));
        assert!(result.slashed.is_empty());
    }

    assert_eq!(cluster.registry().active_ids(&chain).len(), 5);
    let a0 = cluster.registry().get(&ValidatorId::new("a0")).unwrap();
    assert_eq!((a0.reputation(), a0.consecutive_failures), (50.0, 0));
}

#[tokio::test]
async fn bridge_sweep_completes_confirmed_transfer() {
    let network = InMemoryLedgerNetwork::new();
    let cluster = cluster(&network, Arc::new(MemoryStore::new()));
    let bridge = cluster.bridge();
    let (a, b) = (ChainId::new("chainA"), ChainId::new("chainB"));

    let id = bridge.initiate_transfer(&a, &b, "GUARD", 100).unwrap();
    let snapshot = bridge.transfer(&id).unwrap();
    for i in 0..3u8 {
        let signer = ValidatorId::new(format!("a{}", i));
        bridge.submit_signature(&id, &signer, &sign_transfer(&key(i + 1), &snapshot)).unwrap();
    }
    assert_eq!(
        bridge.submit_signature(&id, &ValidatorId::new("a0"), &sign_transfer(&key(1), &snapshot)),
        Err(BridgeError::DuplicateSignature { transfer: id, validator: ValidatorId::new("a0") })
    );
    let confirmed = bridge.transfer(&id).unwrap();
    assert_eq!(confirmed.status(), TransferStatus::Confirmed);
    assert_eq!(confirmed.signature_count(), 3);

    let report = cluster.bridge_sweep().await;
    assert_eq!(report.completed, vec![id]);
    assert_eq!(bridge.transfer(&id).unwrap().status(), TransferStatus::Completed);
    assert_eq!(network.credits()[0].amount, 100);
}

#[tokio::test]
async fn non_bridge_validator_cannot_sign() {
    let network = InMemoryLedgerNetwork::new();
    let cluster = cluster(&network, Arc::new(MemoryStore::new()));
    let bridge = cluster.bridge();
    let (a, b) = (ChainId::new("chainA"), ChainId::new("chainB"));
    let id = bridge.initiate_transfer(&a, &b, "GUARD", 5).unwrap();
    let snapshot = bridge.transfer(&id).unwrap();

    let outsider = ValidatorId::new("a4");
    assert!(matches!(
        bridge.submit_signature(&id, &outsider, &sign_transfer(&key(5), &snapshot)),
        Err(BridgeError::UnauthorizedSigner(_))
    ));
    assert_eq!(bridge.transfer(&id).unwrap().signature_count(), 0);
}

#[tokio::test]
async fn restart_restores_persisted_state() {
    let network = InMemoryLedgerNetwork::new();
    let chain = ChainId::new("chainA");
    network.set_height(&chain, 40);
    let store = Arc::new(MemoryStore::new());

    let first = cluster(&network, store.clone());
    first.consensus_cycle(&chain).await.unwrap();
    let destination = ChainId::new("chainB");
    let transfer = first.bridge().initiate_transfer(&chain, &destination, "GUARD", 7).unwrap();
    first.persist().unwrap();
    assert_eq!(store.load_validators().unwrap().len(), 7);

    let second = cluster(&network, store);
    assert_eq!(second.registry().get(&ValidatorId::new("a1")).unwrap().reputation(), 51.0);
    assert_eq!(second.chains().chain_node(&chain).unwrap().height, 40);
    let restored = second.bridge().transfer(&transfer).unwrap();
    assert_eq!(restored.status(), TransferStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn spawned_tasks_run_rounds_and_persist_on_shutdown() {
    let network = InMemoryLedgerNetwork::new();
    let store = Arc::new(MemoryStore::new());
    let cluster = cluster(&network, store.clone());
    let mut events = cluster.bus().subscribe();

    let handle = cluster.spawn();
    assert_eq!(handle.task_names().len(), 7);
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    handle.shutdown().await.unwrap();

    assert!(!cluster.engine(&ChainId::new("chainA")).unwrap().history().is_empty());
    assert!(!cluster.engine(&ChainId::new("chainB")).unwrap().history().is_empty());
    assert_eq!(store.load_chains().unwrap().len(), 2);

    let mut saw_success = false;
    while let Ok(event) = events.try_recv() {
        saw_success |= matches!(event, ClusterEvent::ConsensusSuccess { .. });
    }
    assert!(saw_success);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_stops_periodic_tasks() {
    let network = InMemoryLedgerNetwork::new();
    let cluster = cluster(&network, Arc::new(MemoryStore::new()));
    let chain = ChainId::new("chainA");

    let handle = cluster.spawn();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let rounds = cluster.engine(&chain).unwrap().history().len();
    assert!(rounds > 0);

    drop(handle);
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(cluster.engine(&chain).unwrap().history().len(), rounds);
}
