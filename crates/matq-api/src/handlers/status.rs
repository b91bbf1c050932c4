//! /status and /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use matq_services::{RunState, WorkerSnapshot};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub slots: usize,
    pub workers: Vec<WorkerSnapshot>,
    pub runs: RunCounts,
}

#[derive(Serialize)]
pub struct RunCounts {
    pub pending: usize,
    pub active: usize,
    pub complete: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub failed: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let count = |s| state.runs.count_in(s);
    let runs = RunCounts {
        pending: count(RunState::Pending),
        active: count(RunState::Dispatching) + count(RunState::Collecting),
        complete: count(RunState::Complete),
        timed_out: count(RunState::TimedOut),
        cancelled: count(RunState::Cancelled),
        failed: count(RunState::Failed),
    };

    Json(StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        slots: state.topology.slots(),
        workers: state.workers.snapshots(),
        runs,
    })
}

// ── /daemon/shutdown ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support;
    use matq_core::{Dims, Operation};

    #[tokio::test]
    async fn status_counts_runs_by_state() {
        let (state, _rx) = test_support::state(3);
        state.workers.register(0);
        state.runs.register("a", Operation::Addition, Dims::new(1, 1), Dims::new(1, 1));
        state.runs.register("b", Operation::Addition, Dims::new(1, 1), Dims::new(1, 1));
        state.runs.set_state("b", RunState::Collecting);

        let Json(status) = handle_status(State(state)).await;
        assert_eq!(status.slots, 3);
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.runs.pending, 1);
        assert_eq!(status.runs.active, 1);
    }

    #[tokio::test]
    async fn shutdown_fires_broadcast() {
        let (state, _rx) = test_support::state(1);
        let mut shutdown_rx = state.shutdown_tx.subscribe();
        handle_shutdown(State(state)).await;
        assert!(shutdown_rx.try_recv().is_ok());
    }
}
