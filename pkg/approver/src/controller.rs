use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{NodeClient, RequestClient};
use crate::queue::RetryQueue;
use crate::sync::SyncEngine;
use pkg_cloud::CloudProvider;

/// Label carried by control-plane nodes.
pub const MASTER_NODE_ROLE_KEY: &str = "node-role.kubernetes.io/master";
/// Label carried by worker nodes.
pub const WORKER_NODE_ROLE_KEY: &str = "node-role.kubernetes.io/node";

/// Drives the sync engine: a resync loop periodically enqueues every signing
/// request name, and a fixed pool of workers drains the retry queue. Event
/// delivery is at-least-once; the engine's idempotence makes redelivery
/// harmless.
pub struct ApproverController {
    requests: Arc<dyn RequestClient>,
    engine: Arc<SyncEngine>,
    queue: Arc<RetryQueue>,
    resync: Duration,
    workers: usize,
}

impl ApproverController {
    pub fn new(
        requests: Arc<dyn RequestClient>,
        engine: SyncEngine,
        resync: Duration,
        workers: usize,
    ) -> Self {
        Self {
            requests,
            engine: Arc::new(engine),
            queue: Arc::new(RetryQueue::default()),
            resync,
            workers: workers.max(1),
        }
    }

    /// Run until the shutdown signal flips. Workers finish their current
    /// item, drain the queue, and exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            "Starting approver controller (workers={}, resync={}s)",
            self.workers,
            self.resync.as_secs()
        );

        let resync_handle = {
            let requests = self.requests.clone();
            let queue = self.queue.clone();
            let resync = self.resync;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(resync);
                loop {
                    ticker.tick().await;
                    match requests.list_names().await {
                        Ok(names) => {
                            debug!("resync: enqueueing {} signing requests", names.len());
                            for name in names {
                                queue.add(&name);
                            }
                        }
                        Err(e) => warn!("resync list failed: {}", e),
                    }
                }
            })
        };

        let mut worker_handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let engine = self.engine.clone();
            let queue = self.queue.clone();
            worker_handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    match engine.sync(&key).await {
                        Ok(()) => queue.forget(&key),
                        Err(e) if e.is_retriable() => {
                            debug!("worker {}: sync {} failed, requeueing: {}", id, key, e);
                            queue.add_rate_limited(&key);
                        }
                        Err(e) => {
                            warn!("worker {}: sync {} failed fatally: {}", id, key, e);
                            queue.forget(&key);
                        }
                    }
                    queue.done(&key);
                }
                debug!("worker {} exiting", id);
            }));
        }

        // wait for shutdown, then drain
        let _ = shutdown.changed().await;
        info!("Shutting down approver controller");
        resync_handle.abort();
        self.queue.shutdown();
        for handle in worker_handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Enqueue one request by name, e.g. from an external event source.
    pub fn enqueue(&self, name: &str) {
        self.queue.add(name);
    }
}

/// Discover the instance groups backing the master and worker roles from
/// the already-registered nodes. Fails when either role has no registered
/// node yet; callers poll until the cluster is populated.
pub async fn discover_role_groups(
    nodes: &dyn NodeClient,
    cloud: &dyn CloudProvider,
) -> anyhow::Result<(HashSet<String>, HashSet<String>)> {
    let all = nodes.list_nodes().await?;

    let mut masters = HashSet::new();
    let mut workers = HashSet::new();
    for node in &all {
        let role = if node.labels.contains_key(MASTER_NODE_ROLE_KEY) {
            Some(&mut masters)
        } else if node.labels.contains_key(WORKER_NODE_ROLE_KEY) {
            Some(&mut workers)
        } else {
            None
        };
        if let Some(set) = role {
            debug!("fetching instance group for node {}", node.name);
            let group = cloud.instance_group(&node.name).await?;
            set.insert(group);
        }
    }

    if masters.is_empty() || workers.is_empty() {
        anyhow::bail!("no nodes available yet for role group discovery");
    }
    Ok((masters, workers))
}
