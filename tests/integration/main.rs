//! matq integration test harness.
//!
//! Every test builds its own in-process cluster: a `MemoryBroker`, a
//! coordinator, and a `LocalPool` running one worker per slot. Nothing is
//! shared between tests, so they run in parallel.
//!
//!   cargo test --test integration

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;

use matq_core::config::MatqConfig;
use matq_services::{
    BrokerSettings, Coordinator, LocalPool, MemoryBroker, NodeLifecycle, OutgoingMessage,
    QueueClient, ReceivedMessage, RetryPolicy, RunStore, Topology, WorkerDeployer,
    WorkerRegistry,
};

mod delivery;
mod failures;
mod pipeline;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Config with short waits so tests finish quickly.
pub fn test_config(slots: usize) -> MatqConfig {
    let mut config = MatqConfig::default();
    config.workers.slots = slots;
    config.workers.poll_wait_ms = 20;
    config.collector.poll_wait_ms = 20;
    config.collector.budget_secs = 10;
    config.queue.visibility_timeout_ms = 10_000;
    config.queue.max_receive_count = 0;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

pub struct Cluster {
    pub broker: MemoryBroker,
    pub coordinator: Coordinator<MemoryBroker>,
    pub pool: LocalPool<MemoryBroker>,
    pub retry: RetryPolicy,
}

impl Cluster {
    /// Queues created, no workers running yet.
    pub async fn idle(config: &MatqConfig) -> Result<Self> {
        let broker = MemoryBroker::new(BrokerSettings::from(&config.queue));
        let retry = RetryPolicy::from(&config.retry);
        let coordinator = Coordinator::new(broker.clone(), config, RunStore::new());
        coordinator
            .topology()
            .create_all(&broker, &retry)
            .await
            .context("failed to create queues")?;
        let pool = LocalPool::new(
            broker.clone(),
            coordinator.topology().clone(),
            config.workers.clone(),
            retry.clone(),
            WorkerRegistry::default(),
        );
        Ok(Self {
            broker,
            coordinator,
            pool,
            retry,
        })
    }

    /// One worker per slot.
    pub async fn start(config: &MatqConfig) -> Result<Self> {
        let cluster = Self::idle(config).await?;
        matq_services::bootstrap(&cluster.pool, config.workers.slots).await?;
        Ok(cluster)
    }

    pub fn topology(&self) -> &Topology {
        self.coordinator.topology()
    }

    pub fn runs(&self) -> &RunStore {
        self.coordinator.runs()
    }

    /// Start the worker for one slot only.
    pub async fn deploy(&self, slot: usize) -> Result<()> {
        let nodes = self.pool.ensure_running(self.topology().slots()).await?;
        self.pool.deploy_worker(&nodes[slot], slot).await
    }

    pub async fn shutdown(self) -> Result<()> {
        self.pool.terminate_all().await?;
        self.topology().delete_all(&self.broker, &self.retry).await;
        Ok(())
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Receive everything currently visible on `queue`, without acknowledging.
pub async fn take_all(broker: &MemoryBroker, queue: &str) -> Result<Vec<ReceivedMessage>> {
    let mut out = Vec::new();
    loop {
        let got = broker.receive(queue, 10, Duration::ZERO).await?;
        if got.is_empty() {
            return Ok(out);
        }
        out.extend(got);
    }
}

pub async fn publish_raw(broker: &MemoryBroker, queue: &str, body: &[u8]) -> Result<()> {
    broker
        .publish_batch(
            queue,
            vec![OutgoingMessage {
                id: "raw".to_string(),
                body: Bytes::copy_from_slice(body),
            }],
        )
        .await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Cluster comes up with the expected queue names and one worker per slot.
#[tokio::test]
async fn test_cluster_topology() {
    let cluster = Cluster::start(&test_config(3)).await.unwrap();

    assert_eq!(
        cluster.broker.queue_names(),
        vec![
            "queue0",
            "queue1",
            "queue2",
            "result-queue-0",
            "result-queue-1",
            "result-queue-2"
        ]
    );
    assert_eq!(cluster.pool.running_slots(), vec![0, 1, 2]);

    cluster.shutdown().await.unwrap();
}
