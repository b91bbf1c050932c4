//! Drives one run through partition, dispatch and collect.
//!
//! `start` partitions the operands, makes sure the slot queues exist and
//! publishes every task. The returned `ActiveRun` owns the collector, so a
//! run that timed out can be collected again without re-dispatching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use matq_core::config::MatqConfig;
use matq_core::partition::{chunk_count, partition};
use matq_core::{Dims, Matrix, MatqError, Operation};

use crate::cancel::CancelFlag;
use crate::collector::{Collector, CollectorSettings};
use crate::dispatcher::Dispatcher;
use crate::queue::QueueClient;
use crate::retry::RetryPolicy;
use crate::run_store::{RunState, RunStore};
use crate::topology::Topology;

/// One distributed operation `a op b`.
#[derive(Debug, Clone)]
pub struct ComputationRun {
    pub id: String,
    pub operation: Operation,
    pub a: Matrix,
    pub b: Matrix,
    /// Rows per chunk. `None` = one chunk per slot.
    pub chunk_rows: Option<usize>,
    /// Overrides the configured collect budget.
    pub budget: Option<Duration>,
}

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh 16-byte hex id for a run.
pub fn run_id(operation: Operation, a: Dims, b: Dims) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut h = blake3::Hasher::new();
    h.update(operation.tag().as_bytes());
    h.update(format!("{a}/{b}").as_bytes());
    h.update(&nanos.to_le_bytes());
    h.update(&RUN_SEQ.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hex::encode(&h.finalize().as_bytes()[..16])
}

impl ComputationRun {
    pub fn new(operation: Operation, a: Matrix, b: Matrix) -> Self {
        Self {
            id: run_id(operation, a.dims(), b.dims()),
            operation,
            a,
            b,
            chunk_rows: None,
            budget: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = Some(rows);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// A run that stopped early, with the operation and operand shapes it was for.
#[derive(Debug, thiserror::Error)]
#[error("{operation} of {a} by {b} failed: {kind}")]
pub struct RunFailure {
    pub run_id: String,
    pub operation: Operation,
    pub a: Dims,
    pub b: Dims,
    #[source]
    pub kind: MatqError,
}

impl RunFailure {
    /// Indices still outstanding for a timed-out or cancelled run.
    pub fn missing(&self) -> Option<&[usize]> {
        self.kind.missing()
    }
}

#[derive(Clone)]
pub struct Coordinator<Q> {
    client: Q,
    topology: Topology,
    retry: RetryPolicy,
    collector: CollectorSettings,
    purge_on_start: bool,
    runs: RunStore,
}

impl<Q: QueueClient> Coordinator<Q> {
    pub fn new(client: Q, config: &MatqConfig, runs: RunStore) -> Self {
        Self {
            client,
            topology: Topology::new(config.queue.name_prefix.clone(), config.workers.slots),
            retry: RetryPolicy::from(&config.retry),
            collector: CollectorSettings::from(&config.collector),
            purge_on_start: config.queue.purge_on_start,
            runs,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    pub fn client(&self) -> &Q {
        &self.client
    }

    /// Partition and dispatch. Fails without dispatching anything on a
    /// shape mismatch.
    pub async fn start(&self, run: ComputationRun) -> Result<ActiveRun<Q>, RunFailure> {
        let ComputationRun {
            id,
            operation,
            a,
            b,
            chunk_rows,
            budget,
        } = run;
        let (a_dims, b_dims) = (a.dims(), b.dims());
        let failure = |kind: MatqError| {
            self.runs.fail(&id, &kind);
            RunFailure {
                run_id: id.clone(),
                operation,
                a: a_dims,
                b: b_dims,
                kind,
            }
        };

        self.runs.register(&id, operation, a_dims, b_dims);
        let cancel = self.runs.cancel_flag(&id);

        let chunks = chunk_count(a.rows(), self.topology.slots(), chunk_rows);
        let parts = partition(operation, &a, &b, chunks).map_err(failure)?;

        tracing::info!(
            run_id = %id,
            %operation,
            a = %a_dims,
            b = %b_dims,
            chunks = parts.len(),
            slots = self.topology.slots(),
            "run starting"
        );
        self.runs.set_expected(&id, parts.len());
        self.runs.set_state(&id, RunState::Dispatching);

        self.topology
            .create_all(&self.client, &self.retry)
            .await
            .map_err(failure)?;
        if self.purge_on_start {
            self.topology
                .purge_all(&self.client, &self.retry)
                .await
                .map_err(failure)?;
        }

        let dispatcher = Dispatcher::new(self.client.clone(), self.topology.clone(), self.retry.clone());
        let report = dispatcher
            .dispatch(&id, operation, &parts, &cancel)
            .await
            .map_err(failure)?;
        if report.cancelled {
            return Err(failure(MatqError::Cancelled {
                expected: parts.len(),
                missing: (0..parts.len()).collect(),
            }));
        }

        let mut settings = self.collector.clone();
        if budget.is_some() {
            settings.budget = budget;
        }
        let collector = Collector::new(
            self.client.clone(),
            self.topology.clone(),
            id.clone(),
            parts.iter().map(|p| p.expected).collect(),
            settings,
            self.retry.clone(),
        )
        .track_in(self.runs.clone());

        Ok(ActiveRun {
            id,
            operation,
            a: a_dims,
            b: b_dims,
            collector,
            cancel,
            runs: self.runs.clone(),
        })
    }

    /// Start and collect in one go.
    pub async fn execute(&self, run: ComputationRun) -> Result<Matrix, RunFailure> {
        let mut active = self.start(run).await?;
        active.collect().await
    }
}

/// A dispatched run whose results are still being gathered.
pub struct ActiveRun<Q> {
    id: String,
    operation: Operation,
    a: Dims,
    b: Dims,
    collector: Collector<Q>,
    cancel: CancelFlag,
    runs: RunStore,
}

impl<Q: QueueClient> ActiveRun<Q> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collector(&self) -> &Collector<Q> {
        &self.collector
    }

    pub fn set_budget(&mut self, budget: Duration) {
        self.collector.set_budget(budget);
    }

    /// Collect until complete, out of budget or cancelled. Safe to call
    /// again after a timeout; results already gathered are kept.
    pub async fn collect(&mut self) -> Result<Matrix, RunFailure> {
        self.runs.set_state(&self.id, RunState::Collecting);
        match self.collector.collect(&mut self.cancel).await {
            Ok(result) => {
                tracing::info!(run_id = %self.id, dims = %result.dims(), "run complete");
                self.runs.complete(&self.id, result.clone());
                Ok(result)
            }
            Err(kind) => {
                self.runs.fail(&self.id, &kind);
                Err(RunFailure {
                    run_id: self.id.clone(),
                    operation: self.operation,
                    a: self.a,
                    b: self.b,
                    kind,
                })
            }
        }
    }
}
