//! Node lifecycle and worker deployment.
//!
//! The coordinator only needs worker slots to exist; how the machines behind
//! them are provisioned stays behind `NodeLifecycle` and `WorkerDeployer`.
//! `LocalPool` is the in-process implementation: each node is a tokio task
//! running one `WorkerLoop`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use matq_core::config::WorkerConfig;

use crate::queue::QueueClient;
use crate::retry::RetryPolicy;
use crate::topology::Topology;
use crate::worker::{WorkerLoop, WorkerRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NodeHandle {
    pub id: String,
    pub ordinal: usize,
}

/// Provisions the machines workers run on.
pub trait NodeLifecycle: Send + Sync {
    /// Make sure at least `count` nodes are running and return them in
    /// ordinal order.
    fn ensure_running(&self, count: usize) -> impl Future<Output = Result<Vec<NodeHandle>>> + Send;

    fn public_address(&self, node: &NodeHandle) -> impl Future<Output = Result<String>> + Send;

    fn terminate_all(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Starts a worker for one slot on a node.
pub trait WorkerDeployer: Send + Sync {
    fn deploy_worker(&self, node: &NodeHandle, slot: usize) -> impl Future<Output = Result<()>> + Send;
}

/// Bring up one node per slot and deploy slot `k` on node `k`.
pub async fn bootstrap<P>(pool: &P, slots: usize) -> Result<Vec<NodeHandle>>
where
    P: NodeLifecycle + WorkerDeployer,
{
    let nodes = pool.ensure_running(slots).await?;
    for (slot, node) in nodes.iter().take(slots).enumerate() {
        pool.deploy_worker(node, slot).await?;
        let address = pool.public_address(node).await?;
        tracing::info!(slot, node = %node.id, %address, "worker deployed");
    }
    Ok(nodes)
}

struct PoolInner<Q> {
    client: Q,
    topology: Topology,
    worker: WorkerConfig,
    retry: RetryPolicy,
    registry: WorkerRegistry,
    nodes: Mutex<Vec<NodeHandle>>,
    workers: Mutex<Vec<(usize, JoinHandle<()>)>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// In-process worker pool.
#[derive(Clone)]
pub struct LocalPool<Q> {
    inner: Arc<PoolInner<Q>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<Q: QueueClient> LocalPool<Q> {
    pub fn new(
        client: Q,
        topology: Topology,
        worker: WorkerConfig,
        retry: RetryPolicy,
        registry: WorkerRegistry,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(PoolInner {
                client,
                topology,
                worker,
                retry,
                registry,
                nodes: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                shutdown_tx,
            }),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    /// Slots with a live worker task.
    pub fn running_slots(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = locked(&self.inner.workers)
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(slot, _)| *slot)
            .collect();
        slots.sort_unstable();
        slots
    }
}

impl<Q: QueueClient> NodeLifecycle for LocalPool<Q> {
    async fn ensure_running(&self, count: usize) -> Result<Vec<NodeHandle>> {
        let mut nodes = locked(&self.inner.nodes);
        while nodes.len() < count {
            let ordinal = nodes.len();
            nodes.push(NodeHandle {
                id: format!("local-{ordinal}"),
                ordinal,
            });
        }
        Ok(nodes.clone())
    }

    async fn public_address(&self, node: &NodeHandle) -> Result<String> {
        if !locked(&self.inner.nodes).contains(node) {
            bail!("unknown node {}", node.id);
        }
        Ok(format!("local://{}", node.id))
    }

    async fn terminate_all(&self) -> Result<()> {
        let workers = std::mem::take(&mut *locked(&self.inner.workers));
        let _ = self.inner.shutdown_tx.send(());
        for (slot, handle) in workers {
            if let Err(e) = handle.await {
                tracing::warn!(slot, error = %e, "worker task ended abnormally");
            }
        }
        locked(&self.inner.nodes).clear();
        tracing::info!("all local nodes terminated");
        Ok(())
    }
}

impl<Q: QueueClient> WorkerDeployer for LocalPool<Q> {
    async fn deploy_worker(&self, node: &NodeHandle, slot: usize) -> Result<()> {
        if slot >= self.inner.topology.slots() {
            bail!("slot {slot} out of range 0..{}", self.inner.topology.slots());
        }
        if !locked(&self.inner.nodes).contains(node) {
            bail!("unknown node {}", node.id);
        }

        let mut workers = locked(&self.inner.workers);
        if workers.iter().any(|(s, h)| *s == slot && !h.is_finished()) {
            bail!("slot {slot} already has a running worker");
        }
        workers.retain(|(s, _)| *s != slot);

        let stats = self.inner.registry.register(slot);
        let worker = WorkerLoop::new(
            slot,
            self.inner.client.clone(),
            &self.inner.topology,
            &self.inner.worker,
            self.inner.retry.clone(),
            stats,
        );
        let handle = tokio::spawn(worker.run(self.inner.shutdown_tx.subscribe()));
        workers.push((slot, handle));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_broker::MemoryBroker;

    fn pool(slots: usize) -> LocalPool<MemoryBroker> {
        LocalPool::new(
            MemoryBroker::default(),
            Topology::new("", slots),
            WorkerConfig { poll_wait_ms: 10, ..WorkerConfig::default() },
            RetryPolicy::immediate(1),
            WorkerRegistry::default(),
        )
    }

    #[tokio::test]
    async fn bootstrap_runs_one_worker_per_slot() {
        let pool = pool(3);
        let nodes = bootstrap(&pool, 3).await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(pool.running_slots(), vec![0, 1, 2]);
        assert_eq!(pool.registry().snapshots().len(), 3);

        pool.terminate_all().await.unwrap();
        assert!(pool.running_slots().is_empty());
    }

    #[tokio::test]
    async fn ensure_running_is_idempotent() {
        let pool = pool(2);
        let first = pool.ensure_running(2).await.unwrap();
        let second = pool.ensure_running(1).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.public_address(&first[1]).await.unwrap(), "local://local-1");
    }

    #[tokio::test]
    async fn deploy_rejects_bad_slot_and_double_deploy() {
        let pool = pool(1);
        let nodes = pool.ensure_running(1).await.unwrap();
        assert!(pool.deploy_worker(&nodes[0], 1).await.is_err());
        pool.deploy_worker(&nodes[0], 0).await.unwrap();
        assert!(pool.deploy_worker(&nodes[0], 0).await.is_err());
        pool.terminate_all().await.unwrap();
    }
}
