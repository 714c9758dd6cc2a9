// PERIODIC TASK RUNTIME
// One health poll and one consensus scheduler per chain, plus a bridge
// sweep, a metrics sampler and a persistence task. Every task owns its own
// ticker; a slow chain only delays its own tasks.
//
// SAFETY INVARIANTS:
// 1. Rounds of one chain never overlap: one task, awaited sequentially
// 2. Shutdown lets each task finish the iteration it is in
// 3. A final snapshot is persisted after every task stopped

use crate::cluster::{Cluster, ClusterError};
use futures::future::join_all;
use guard_core::EventSink;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Running cluster. Dropping it without `shutdown` still stops every periodic
/// task, but leaves the monitor feed attached and skips the final snapshot.
pub struct ClusterHandle {
    cluster: Arc<Cluster>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    monitor_feed: JoinHandle<()>,
}

fn periodic<F, Fut>(
    name: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> (String, JoinHandle<()>)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => tick().await,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("[Scheduler] {} stopped", task_name);
    });
    (name, handle)
}

impl Cluster {
    /// Start every periodic task. Requires a tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> ClusterHandle {
        let (shutdown, rx) = watch::channel(false);
        let timing = self.config().timing.clone();
        let monitor: Arc<dyn EventSink> = self.monitor().clone();
        let monitor_feed = self.bus().attach(monitor);
        let mut tasks = Vec::new();

        for chain in self.chain_ids() {
            let cluster = self.clone();
            let polled = chain.clone();
            let health = move || {
                let cluster = cluster.clone();
                let chain = polled.clone();
                async move {
                    if let Err(e) = cluster.health_cycle(&chain).await {
                        warn!("[Scheduler] health poll of {} failed: {}", chain, e);
                    }
                }
            };
            let name = format!("health:{}", chain);
            tasks.push(periodic(name, timing.health_interval(), rx.clone(), health));

            let cluster = self.clone();
            let scheduled = chain.clone();
            let consensus = move || {
                let cluster = cluster.clone();
                let chain = scheduled.clone();
                async move {
                    match cluster.consensus_cycle(&chain).await {
                        Ok(Some(result)) => debug!(
                            "[Scheduler] {} round {} {:?} ({}/{})",
                            chain,
                            result.round,
                            result.outcome,
                            result.positive_votes,
                            result.total_votes
                        ),
                        Ok(None) => {}
                        Err(e) => warn!("[Scheduler] consensus on {} failed: {}", chain, e),
                    }
                }
            };
            let name = format!("consensus:{}", chain);
            tasks.push(periodic(name, timing.consensus_interval(), rx.clone(), consensus));
        }

        let cluster = self.clone();
        let sweep = move || {
            let cluster = cluster.clone();
            async move {
                let report = cluster.bridge_sweep().await;
                if !report.expired.is_empty() || !report.completed.is_empty() {
                    info!(
                        "[Scheduler] bridge sweep: {} expired, {} completed, {} retrying",
                        report.expired.len(),
                        report.completed.len(),
                        report.retrying.len()
                    );
                }
            }
        };
        let name = "bridge-sweep".to_string();
        tasks.push(periodic(name, timing.sweep_interval(), rx.clone(), sweep));

        let cluster = self.clone();
        let sample = move || {
            let cluster = cluster.clone();
            async move {
                cluster.metrics_cycle();
            }
        };
        tasks.push(periodic("metrics".to_string(), timing.metrics_interval(), rx.clone(), sample));

        let cluster = self.clone();
        let persist = move || {
            let cluster = cluster.clone();
            async move {
                if let Err(e) = cluster.persist() {
                    warn!("[Scheduler] persisting state failed: {}", e);
                }
            }
        };
        tasks.push(periodic("persistence".to_string(), timing.metrics_interval(), rx, persist));

        info!("[Scheduler] started {} periodic tasks", tasks.len());
        ClusterHandle { cluster: self.clone(), shutdown, tasks, monitor_feed }
    }
}

impl ClusterHandle {
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Signal every task, wait for them to stop, then write a final snapshot.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!("[Scheduler] shutting down {} tasks", self.tasks.len());
        // receivers only disappear once their tasks ended
        let _ = self.shutdown.send(true);

        let (names, handles): (Vec<String>, Vec<JoinHandle<()>>) =
            self.tasks.into_iter().unzip();
        for (name, joined) in names.iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                warn!("[Scheduler] task {} ended abnormally: {}", name, e);
            }
        }
        self.monitor_feed.abort();

        self.cluster.persist()?;
        info!("[Scheduler] final state persisted");
        Ok(())
    }
}
