//! Queue naming for N worker slots.
//!
//! Slot `k` reads tasks from `{prefix}queue{k}` and writes completions to
//! `{prefix}result-queue-{k}`. Task `i` goes to slot `i mod N`.

use matq_core::MatqError;

use crate::queue::QueueClient;
use crate::retry::{self, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    prefix: String,
    slots: usize,
}

impl Topology {
    /// `slots` below 1 is raised to 1.
    pub fn new(prefix: impl Into<String>, slots: usize) -> Self {
        Self {
            prefix: prefix.into(),
            slots: slots.max(1),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn slot_for(&self, index: usize) -> usize {
        index % self.slots
    }

    pub fn input_queue(&self, slot: usize) -> String {
        format!("{}queue{}", self.prefix, slot)
    }

    pub fn result_queue(&self, slot: usize) -> String {
        format!("{}result-queue-{}", self.prefix, slot)
    }

    pub fn result_queues(&self) -> Vec<String> {
        (0..self.slots).map(|k| self.result_queue(k)).collect()
    }

    /// Input queues then result queues.
    pub fn all_queues(&self) -> Vec<String> {
        (0..self.slots)
            .map(|k| self.input_queue(k))
            .chain(self.result_queues())
            .collect()
    }

    pub async fn create_all<Q: QueueClient>(
        &self,
        client: &Q,
        retry: &RetryPolicy,
    ) -> Result<(), MatqError> {
        for name in self.all_queues() {
            retry::with_backoff(retry, "create queue", || client.create_queue(&name))
                .await
                .map_err(|e| e.into_matq(&name))?;
        }
        tracing::info!(slots = self.slots, prefix = %self.prefix, "queues ready");
        Ok(())
    }

    pub async fn purge_all<Q: QueueClient>(
        &self,
        client: &Q,
        retry: &RetryPolicy,
    ) -> Result<(), MatqError> {
        for name in self.all_queues() {
            retry::with_backoff(retry, "purge queue", || client.purge_queue(&name))
                .await
                .map_err(|e| e.into_matq(&name))?;
        }
        Ok(())
    }

    /// Best effort: a failure on one queue is logged and the rest still go.
    pub async fn delete_all<Q: QueueClient>(&self, client: &Q, retry: &RetryPolicy) {
        for name in self.all_queues() {
            if let Err(e) =
                retry::with_backoff(retry, "delete queue", || client.delete_queue(&name)).await
            {
                tracing::warn!(queue = %name, error = %e, "failed to delete queue");
            }
        }
        tracing::info!(slots = self.slots, "queues deleted");
    }
}
