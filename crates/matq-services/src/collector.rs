//! Collector — gathers completion messages and merges them into the result.
//!
//! Results are kept in a map keyed by task index. Inserting an index twice
//! overwrites it, so redelivered completions are harmless, and the merge
//! walks the map in key order so arrival order never matters. A collect call
//! that runs out of budget or is cancelled reports the exact missing indices
//! and keeps everything gathered so far; calling `collect` again resumes.
//!
//! Slot queues outlive a run, so a worker still busy with an earlier run's
//! task can publish after the next run has started. Completions tagged with
//! another run id are acknowledged and dropped.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use matq_core::config::CollectorConfig;
use matq_core::{CompletionMessage, Dims, Matrix, MatqError};

use crate::cancel::CancelFlag;
use crate::queue::QueueClient;
use crate::retry::{self, RetryPolicy};
use crate::run_store::RunStore;
use crate::topology::Topology;

/// Default budget for a result of `elements` cells: 5s up to 1k, 30s up to
/// 10k, 60s up to 100k, 120s up to 1M, then another 120s per extra million.
pub fn wait_budget(elements: usize) -> Duration {
    let secs = match elements {
        0..=1_000 => 5,
        1_001..=10_000 => 30,
        10_001..=100_000 => 60,
        100_001..=1_000_000 => 120,
        n => 120 + 120 * (n - 1_000_000).div_ceil(1_000_000) as u64,
    };
    Duration::from_secs(secs)
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub poll_wait: Duration,
    pub receive_batch: usize,
    /// `None` = derive from result size.
    pub budget: Option<Duration>,
}

impl From<&CollectorConfig> for CollectorSettings {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            poll_wait: config.poll_wait(),
            receive_batch: config.receive_batch,
            budget: config.budget(),
        }
    }
}

/// Whether an accepted completion filled a new index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    New,
    Duplicate,
    /// Belongs to another run; acknowledged and discarded.
    Stale,
}

pub struct Collector<Q> {
    client: Q,
    topology: Topology,
    run_id: String,
    /// Shape of every chunk result, by index.
    expected: Vec<Dims>,
    results: BTreeMap<usize, Matrix>,
    poll_wait: Duration,
    receive_batch: usize,
    budget: Duration,
    retry: RetryPolicy,
    duplicates: u64,
    stale: u64,
    rejected: u64,
    progress: Option<RunStore>,
}

impl<Q: QueueClient> Collector<Q> {
    pub fn new(
        client: Q,
        topology: Topology,
        run_id: impl Into<String>,
        expected: Vec<Dims>,
        settings: CollectorSettings,
        retry: RetryPolicy,
    ) -> Self {
        let elements = expected.iter().map(Dims::elements).sum();
        Self {
            client,
            topology,
            run_id: run_id.into(),
            expected,
            results: BTreeMap::new(),
            poll_wait: settings.poll_wait,
            receive_batch: settings.receive_batch.max(1),
            budget: settings.budget.unwrap_or_else(|| wait_budget(elements)),
            retry,
            duplicates: 0,
            stale: 0,
            rejected: 0,
            progress: None,
        }
    }

    /// Report progress into `store` after every poll round.
    pub fn track_in(mut self, store: RunStore) -> Self {
        self.progress = Some(store);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn set_budget(&mut self, budget: Duration) {
        self.budget = budget;
    }

    pub fn expected_count(&self) -> usize {
        self.expected.len()
    }

    pub fn collected_count(&self) -> usize {
        self.results.len()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Completions from other runs that were dropped.
    pub fn stale(&self) -> u64 {
        self.stale
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Indices with no result yet, ascending.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.expected.len())
            .filter(|i| !self.results.contains_key(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() == self.expected.len()
    }

    /// Results gathered so far, by index.
    pub fn partial(&self) -> &BTreeMap<usize, Matrix> {
        &self.results
    }

    /// Validate a completion against the run and store it.
    pub fn accept(&mut self, completion: CompletionMessage) -> Result<Accepted, MatqError> {
        if completion.run != self.run_id {
            self.stale += 1;
            tracing::debug!(
                run_id = %self.run_id,
                from = %completion.run,
                index = completion.index,
                "dropping completion from another run"
            );
            return Ok(Accepted::Stale);
        }
        let Some(expected) = self.expected.get(completion.index) else {
            return Err(MatqError::MalformedCompletion(format!(
                "index {} outside 0..{}",
                completion.index,
                self.expected.len()
            )));
        };
        if completion.result.dims() != *expected {
            return Err(MatqError::MalformedCompletion(format!(
                "index {} has shape {}, expected {}",
                completion.index,
                completion.result.dims(),
                expected
            )));
        }
        match self.results.insert(completion.index, completion.result) {
            Some(_) => {
                self.duplicates += 1;
                Ok(Accepted::Duplicate)
            }
            None => Ok(Accepted::New),
        }
    }

    /// Stack the chunk results in index order. `None` until every index is in.
    pub fn merge(&self) -> Option<Matrix> {
        if !self.is_complete() {
            return None;
        }
        match Matrix::vstack(self.results.values()) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::error!(error = %e, "merge failed on validated chunks");
                None
            }
        }
    }

    /// One bounded receive on every result queue. Returns how many new
    /// indices were filled.
    pub async fn poll_round(&mut self) -> usize {
        let queues = self.topology.result_queues();
        let rounds = {
            let client = &self.client;
            let retry = &self.retry;
            let (batch, wait) = (self.receive_batch, self.poll_wait);
            join_all(queues.iter().map(|queue| async move {
                let received = retry::with_backoff(retry, "receive completions", || {
                    client.receive(queue, batch, wait)
                })
                .await;
                (queue, received)
            }))
            .await
        };

        let mut filled = 0;
        for (queue, received) in rounds {
            let messages = match received {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(%queue, error = %e, "receive failed");
                    continue;
                }
            };
            for msg in messages {
                let accepted = CompletionMessage::decode(&msg.body).and_then(|c| self.accept(c));
                match accepted {
                    Ok(kind) => {
                        if kind == Accepted::New {
                            filled += 1;
                        }
                        let acked = retry::with_backoff(&self.retry, "acknowledge completion", || {
                            self.client.delete(queue, &msg.receipt)
                        })
                        .await;
                        if let Err(e) = acked {
                            tracing::warn!(%queue, error = %e, "failed to acknowledge completion");
                        }
                    }
                    Err(e) => {
                        self.rejected += 1;
                        tracing::warn!(
                            %queue,
                            message_id = %msg.message_id,
                            error = %e,
                            "rejecting completion, not acknowledged"
                        );
                    }
                }
            }
        }

        if filled > 0 {
            tracing::debug!(
                filled,
                collected = self.results.len(),
                expected = self.expected.len(),
                "completions collected"
            );
            if let Some(store) = &self.progress {
                store.record_progress(&self.run_id, self.results.len());
            }
        }
        filled
    }

    /// Poll until every index is in, the budget runs out, or `cancel` fires.
    pub async fn collect(&mut self, cancel: &mut CancelFlag) -> Result<Matrix, MatqError> {
        let deadline = Instant::now() + self.budget;
        let expected = self.expected.len();

        loop {
            if let Some(merged) = self.merge() {
                tracing::info!(chunks = expected, dims = %merged.dims(), "result merged");
                return Ok(merged);
            }
            if cancel.is_cancelled() {
                let missing = self.missing();
                tracing::info!(expected, missing = missing.len(), "collect cancelled");
                return Err(MatqError::Cancelled { expected, missing });
            }
            if Instant::now() >= deadline {
                let missing = self.missing();
                tracing::warn!(
                    expected,
                    missing = missing.len(),
                    budget_secs = self.budget.as_secs_f64(),
                    "collect timed out"
                );
                return Err(MatqError::TimedOut { expected, missing });
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.poll_round() => {}
            }
        }
    }
}
