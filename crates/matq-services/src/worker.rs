//! Worker loop, one per slot.
//!
//! Repeatedly receives a task from its input queue, computes the result,
//! publishes the completion to its result queue and only then acknowledges
//! the task. A task whose completion was never published stays unacked and
//! comes back after the visibility timeout.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use matq_core::config::WorkerConfig;
use matq_core::{kernels, CompletionMessage, TaskMessage};

use crate::queue::{OutgoingMessage, QueueClient, ReceivedMessage};
use crate::retry::{self, RetryPolicy};
use crate::topology::Topology;

// ── State & stats ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Fetching,
    Processing,
    Publishing,
    Acking,
    Stopped,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Fetching,
            2 => Self::Processing,
            3 => Self::Publishing,
            4 => Self::Acking,
            5 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Live counters for one worker, shared with the status API.
#[derive(Debug, Default)]
pub struct WorkerStats {
    state: AtomicU8,
    processed: AtomicU64,
    malformed: AtomicU64,
    compute_failures: AtomicU64,
    publish_retries: AtomicU64,
    publish_failures: AtomicU64,
    ack_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub slot: usize,
    pub state: WorkerState,
    pub processed: u64,
    pub malformed: u64,
    pub compute_failures: u64,
    pub publish_retries: u64,
    pub publish_failures: u64,
    pub ack_failures: u64,
}

impl WorkerStats {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, slot: usize) -> WorkerSnapshot {
        WorkerSnapshot {
            slot,
            state: self.state(),
            processed: self.processed(),
            malformed: self.malformed.load(Ordering::Relaxed),
            compute_failures: self.compute_failures.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }
}

/// slot → stats for every worker this process runs.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<usize, Arc<WorkerStats>>>,
}

impl WorkerRegistry {
    /// Fresh stats for `slot`, replacing any previous entry.
    pub fn register(&self, slot: usize) -> Arc<WorkerStats> {
        let stats = Arc::new(WorkerStats::default());
        self.workers.insert(slot, stats.clone());
        stats
    }

    pub fn get(&self, slot: usize) -> Option<Arc<WorkerStats>> {
        self.workers.get(&slot).map(|s| s.value().clone())
    }

    /// Sorted by slot.
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let mut out: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|e| e.value().snapshot(*e.key()))
            .collect();
        out.sort_by_key(|s| s.slot);
        out
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

/// What happened to one received task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { index: usize },
    Malformed,
    ComputeFailed { index: usize },
    PublishFailed { index: usize },
    AckFailed { index: usize },
}

pub struct WorkerLoop<Q> {
    slot: usize,
    client: Q,
    input_queue: String,
    result_queue: String,
    poll_wait: Duration,
    receive_batch: usize,
    retry: RetryPolicy,
    stats: Arc<WorkerStats>,
}

impl<Q: QueueClient> WorkerLoop<Q> {
    pub fn new(
        slot: usize,
        client: Q,
        topology: &Topology,
        config: &WorkerConfig,
        retry: RetryPolicy,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            slot,
            client,
            input_queue: topology.input_queue(slot),
            result_queue: topology.result_queue(slot),
            poll_wait: config.poll_wait(),
            receive_batch: config.receive_batch.max(1),
            retry,
            stats,
        }
    }

    /// Run until the shutdown channel fires. A task already received is
    /// finished before the loop exits.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(slot = self.slot, queue = %self.input_queue, "worker started");

        loop {
            self.stats.set_state(WorkerState::Fetching);
            let received = tokio::select! {
                _ = shutdown.recv() => break,
                r = self.client.receive(&self.input_queue, self.receive_batch, self.poll_wait) => r,
            };

            match received {
                Ok(messages) => {
                    for msg in &messages {
                        self.process(msg).await;
                    }
                    self.stats.set_state(WorkerState::Idle);
                }
                Err(e) => {
                    self.stats.set_state(WorkerState::Idle);
                    tracing::warn!(slot = self.slot, error = %e, "receive failed");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.poll_wait) => {}
                    }
                }
            }
        }

        self.stats.set_state(WorkerState::Stopped);
        tracing::info!(slot = self.slot, processed = self.stats.processed(), "worker stopped");
    }

    /// Handle one delivery end to end.
    pub async fn process(&self, msg: &ReceivedMessage) -> TaskOutcome {
        self.stats.set_state(WorkerState::Processing);

        let task = match TaskMessage::decode(&msg.body) {
            Ok(t) => t,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    slot = self.slot,
                    message_id = %msg.message_id,
                    receive_count = msg.receive_count,
                    error = %e,
                    "discarding malformed task, not acknowledged"
                );
                return TaskOutcome::Malformed;
            }
        };
        let index = task.index;

        let result = match kernels::apply(task.op, &task.a, &task.b) {
            Ok(r) => r,
            Err(e) => {
                self.stats.compute_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot = self.slot, index, error = %e, "task failed to compute");
                return TaskOutcome::ComputeFailed { index };
            }
        };

        self.stats.set_state(WorkerState::Publishing);
        let completion = CompletionMessage {
            index,
            result,
            run: task.run,
        };
        let body = match completion.encode() {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot = self.slot, index, error = %e, "failed to encode completion");
                return TaskOutcome::PublishFailed { index };
            }
        };
        let entry = OutgoingMessage {
            id: index.to_string(),
            body,
        };

        let mut attempts = 0u64;
        let published = retry::with_backoff(&self.retry, "publish completion", || {
            attempts += 1;
            self.client.publish_batch(&self.result_queue, vec![entry.clone()])
        })
        .await;
        self.stats
            .publish_retries
            .fetch_add(attempts.saturating_sub(1), Ordering::Relaxed);
        if let Err(e) = published {
            self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                slot = self.slot,
                index,
                error = %e,
                "completion not published, task left for redelivery"
            );
            return TaskOutcome::PublishFailed { index };
        }

        self.stats.set_state(WorkerState::Acking);
        let acked = retry::with_backoff(&self.retry, "acknowledge task", || {
            self.client.delete(&self.input_queue, &msg.receipt)
        })
        .await;
        match acked {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(slot = self.slot, index, "task completed");
                TaskOutcome::Completed { index }
            }
            Err(e) => {
                self.stats.ack_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot = self.slot, index, error = %e, "failed to acknowledge task");
                TaskOutcome::AckFailed { index }
            }
        }
    }
}
