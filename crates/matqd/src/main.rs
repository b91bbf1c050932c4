//! matqd — distributed matrix operations daemon.
//!
//! Hosts the broker, one worker per slot, the run executor and the HTTP API.

use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use matq_core::config::MatqConfig;
use matq_services::{
    bootstrap, BrokerSettings, ComputationRun, Coordinator, LocalPool, MemoryBroker,
    NodeLifecycle, RetryPolicy, RunStore, Topology, WorkerRegistry,
};

mod executor;

/// Pending runs the API may queue before submissions are refused.
const SUBMIT_QUEUE_DEPTH: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MatqConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = MatqConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MatqConfig::default()
    });

    if let Some(slots) = std::env::args().nth(1) {
        config.workers.slots = slots
            .parse()
            .with_context(|| format!("slot count must be a number, got {slots:?}"))?;
    }
    tracing::info!(
        slots = config.workers.slots,
        prefix = %config.queue.name_prefix,
        "matqd starting"
    );

    // Broker and queues
    let broker = MemoryBroker::new(BrokerSettings::from(&config.queue));
    let retry = RetryPolicy::from(&config.retry);
    let topology = Topology::new(config.queue.name_prefix.clone(), config.workers.slots);
    topology
        .create_all(&broker, &retry)
        .await
        .context("failed to create slot queues")?;

    // Workers
    let workers = WorkerRegistry::default();
    let pool = LocalPool::new(
        broker.clone(),
        topology.clone(),
        config.workers.clone(),
        retry.clone(),
        workers.clone(),
    );
    bootstrap(&pool, topology.slots())
        .await
        .context("failed to start workers")?;

    // Shutdown broadcast
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // Run executor
    let runs = RunStore::new();
    let coordinator = Coordinator::new(broker.clone(), &config, runs.clone());
    let (submit_tx, submit_rx) = mpsc::channel::<ComputationRun>(SUBMIT_QUEUE_DEPTH);
    let executor_task = tokio::spawn(executor::run(
        coordinator,
        submit_rx,
        shutdown_tx.subscribe(),
    ));

    // HTTP API
    let state = matq_api::ApiState {
        runs,
        broker: broker.clone(),
        topology: topology.clone(),
        workers,
        max_elements: config.api.max_elements,
        submit_tx,
        shutdown_tx: shutdown_tx.clone(),
        started_at: Instant::now(),
    };
    let api_port = config.api.port;
    let api_task = tokio::spawn(async move {
        if let Err(e) = matq_api::serve(state, api_port).await {
            tracing::error!(error = %e, "API server failed");
        }
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()       => tracing::info!("shutting down"),
        _ = tokio::signal::ctrl_c()  => tracing::info!("interrupted, shutting down"),
        r = api_task                 => tracing::error!("API server exited: {:?}", r),
    }
    let _ = shutdown_tx.send(());

    if let Err(e) = executor_task.await {
        tracing::warn!(error = %e, "run executor ended abnormally");
    }
    pool.terminate_all().await?;
    topology.delete_all(&broker, &retry).await;

    Ok(())
}
