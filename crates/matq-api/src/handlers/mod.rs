//! HTTP API handlers — exposes daemon state as JSON.

pub mod queues;
pub mod runs;
pub mod status;

use std::time::Instant;

use tokio::sync::{broadcast, mpsc};

use matq_services::{ComputationRun, MemoryBroker, RunStore, Topology, WorkerRegistry};

#[derive(Clone)]
pub struct ApiState {
    pub runs: RunStore,
    pub broker: MemoryBroker,
    pub topology: Topology,
    pub workers: WorkerRegistry,
    /// Submissions larger than this many cells per matrix are refused.
    pub max_elements: usize,
    /// Runs accepted over HTTP go here; the daemon executes them in order.
    pub submit_tx: mpsc::Sender<ComputationRun>,
    /// Fires once to stop the daemon.
    pub shutdown_tx: broadcast::Sender<()>,
    pub started_at: Instant,
}

// Re-export handler functions for use in router setup.
pub use queues::handle_queues;
pub use runs::{handle_run_cancel, handle_run_inspect, handle_runs, handle_submit_run};
pub use status::{handle_shutdown, handle_status};
