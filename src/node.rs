// NODE RUNTIME
// Glue between the command line and the cluster: configuration loading,
// state store selection, key generation and the simulated ledger network.

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use guard_core::ledger::memory::InMemoryLedgerNetwork;
use guard_core::{ClusterConfig, LedgerConnector, StorageConfig};
use guard_interop::JsonRpcConnector;
use guard_scheduler::Cluster;
use guard_state::{MemoryStore, SledStore, StateStore, StorageError};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

pub fn load_config(path: &Path) -> Result<ClusterConfig> {
    ClusterConfig::load(path)
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// sled store at the configured path, in-memory store otherwise.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn StateStore>, StorageError> {
    match &config.path {
        Some(path) => {
            info!("[Node] persisting state to {}", path);
            Ok(Arc::new(SledStore::open(path)?))
        }
        None => {
            warn!("[Node] no storage path configured, state will not survive restarts");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypair {
    pub secret_hex: String,
    pub public_hex: String,
}

pub fn generate_keypair() -> Keypair {
    let key = SigningKey::generate(&mut OsRng);
    Keypair {
        secret_hex: hex::encode(key.to_bytes()),
        public_hex: hex::encode(key.verifying_key().to_bytes()),
    }
}

/// In-memory ledgers for every configured chain, all starting at height 1.
pub fn simulated_network(config: &ClusterConfig) -> InMemoryLedgerNetwork {
    let network = InMemoryLedgerNetwork::new();
    for chain in config.chain_ids() {
        network.set_height(&chain, 1);
    }
    network
}

/// Advance every simulated ledger and queue a few transactions per chain on
/// each consensus interval until `shutdown` flips.
pub fn spawn_simulated_traffic(
    cluster: Arc<Cluster>,
    network: InMemoryLedgerNetwork,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(cluster.config().timing.consensus_interval());
        let mut sequence: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for chain in cluster.chain_ids() {
                        network.advance(&chain, 1);
                        let count = rand::thread_rng().gen_range(1..=8);
                        for _ in 0..count {
                            sequence += 1;
                            let transaction = format!("sim-{}-{}", chain, sequence);
                            if let Err(e) = cluster.submit_transaction(&chain, transaction) {
                                warn!(
                                    "[Simulation] could not queue transaction on {}: {}",
                                    chain, e
                                );
                            }
                        }
                        debug!("[Simulation] queued {} transactions on {}", count, chain);
                    }
                }
            }
        }
    })
}

/// Run the cluster until Ctrl-C, then shut down gracefully.
pub async fn run(config: ClusterConfig, simulate: bool) -> Result<()> {
    let store = open_store(&config.storage).context("opening state store")?;
    let network = simulate.then(|| simulated_network(&config));
    let connector: Arc<dyn LedgerConnector> = match &network {
        Some(network) => Arc::new(network.clone()),
        None => Arc::new(JsonRpcConnector::new()),
    };

    let cluster = Cluster::bootstrap(config, connector, store)?;
    let handle = cluster.spawn();
    let (stop, stopped) = watch::channel(false);
    let traffic =
        network.map(|network| spawn_simulated_traffic(cluster.clone(), network, stopped));
    let mode = if simulate { " (simulated)" } else { "" };
    info!("[Node] running {} chains{}", cluster.chain_ids().len(), mode);

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("[Node] interrupt received, stopping");

    let _ = stop.send(true);
    if let Some(traffic) = traffic {
        traffic.await.context("simulation task")?;
    }
    handle.shutdown().await?;
    info!("[Node] stopped");
    Ok(())
}
