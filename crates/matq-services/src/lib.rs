//! matq-services — queue plumbing and the run pipeline built on it.
//!
//! Everything here is generic over `QueueClient`; `MemoryBroker` is the
//! in-process implementation used by the daemon, the CLI and the tests.

pub mod cancel;
pub mod collector;
pub mod coordinator;
pub mod dispatcher;
pub mod memory_broker;
pub mod nodes;
pub mod queue;
pub mod retry;
pub mod run_store;
pub mod topology;
pub mod worker;

pub use cancel::{cancel_pair, CancelFlag, Canceller};
pub use collector::{wait_budget, Collector, CollectorSettings};
pub use coordinator::{ActiveRun, ComputationRun, Coordinator, RunFailure};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use memory_broker::{BrokerSettings, MemoryBroker, QueueDepth};
pub use nodes::{bootstrap, LocalPool, NodeHandle, NodeLifecycle, WorkerDeployer};
pub use queue::{OutgoingMessage, QueueClient, QueueError, ReceivedMessage, MAX_BATCH};
pub use retry::RetryPolicy;
pub use run_store::{RunRecord, RunState, RunStore};
pub use topology::Topology;
pub use worker::{TaskOutcome, WorkerLoop, WorkerRegistry, WorkerSnapshot, WorkerState, WorkerStats};
