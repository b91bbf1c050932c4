//! Handlers for /runs: submit, list, inspect and cancel.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;

use matq_core::partition::{check_elements, check_random_shape, random_operands, result_dims};
use matq_core::{Matrix, Operation};
use matq_services::{ComputationRun, RunRecord};

use super::ApiState;

// ── /runs (GET) ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct RunsResponse {
    pub runs: Vec<RunJson>,
}

#[derive(Serialize)]
pub struct RunJson {
    pub run_id: String,
    pub operation: Operation,
    pub a: String,
    pub b: String,
    pub state: matq_services::RunState,
    pub expected: usize,
    pub collected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Matrix>,
}

pub async fn handle_runs(State(state): State<ApiState>) -> Json<RunsResponse> {
    let runs = state
        .runs
        .all()
        .into_iter()
        .map(|r| run_to_json(r, false))
        .collect();
    Json(RunsResponse { runs })
}

// ── /runs/{id} (GET) ─────────────────────────────────────────────────────────

pub async fn handle_run_inspect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RunJson>, (StatusCode, String)> {
    state
        .runs
        .get(&id)
        .map(|r| Json(run_to_json(r, true)))
        .ok_or((StatusCode::NOT_FOUND, format!("no run {id}")))
}

// ── /runs (POST) ─────────────────────────────────────────────────────────────

/// Either explicit operands, or `rows`/`cols` for seeded random ones.
#[derive(Deserialize)]
pub struct SubmitRunRequest {
    pub operation: String,
    pub a: Option<Matrix>,
    pub b: Option<Matrix>,
    pub rows: Option<usize>,
    pub cols: Option<usize>,
    pub seed: Option<u64>,
    pub max_value: Option<u32>,
    pub chunk_rows: Option<usize>,
    pub budget_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct SubmitRunResponse {
    pub run_id: String,
    pub operation: Operation,
    pub a: String,
    pub b: String,
}

pub async fn handle_submit_run(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRunRequest>,
) -> Result<Json<SubmitRunResponse>, (StatusCode, String)> {
    let run = build_run(req, state.max_elements)?;
    let (operation, a, b) = (run.operation, run.a.dims(), run.b.dims());
    let run_id = run.id.clone();

    state.runs.register(&run_id, operation, a, b);
    if let Err(e) = state.submit_tx.try_send(run) {
        let reason = match e {
            TrySendError::Full(_) => "run queue full",
            TrySendError::Closed(_) => "run executor stopped",
        };
        state.runs.fail(
            &run_id,
            &matq_core::MatqError::QueueUnavailable {
                queue: "runs".to_string(),
                reason: reason.to_string(),
            },
        );
        return Err((StatusCode::SERVICE_UNAVAILABLE, reason.to_string()));
    }

    tracing::info!(run_id = %run_id, %operation, %a, %b, "run submitted");

    Ok(Json(SubmitRunResponse {
        run_id,
        operation,
        a: a.to_string(),
        b: b.to_string(),
    }))
}

/// Validate a submission and build its run. Shapes are bounded by
/// `max_elements` before anything is allocated.
fn build_run(
    req: SubmitRunRequest,
    max_elements: usize,
) -> Result<ComputationRun, (StatusCode, String)> {
    let bad = |msg: String| (StatusCode::BAD_REQUEST, msg);
    let operation: Operation = req.operation.parse().map_err(|e: matq_core::MatqError| bad(e.to_string()))?;

    let (a, b) = match (req.a, req.b, req.rows, req.cols) {
        (Some(a), Some(b), _, _) => (a, b),
        (None, None, Some(rows), Some(cols)) => {
            check_random_shape(operation, rows, cols, max_elements)
                .map_err(|e| bad(e.to_string()))?;
            random_operands(
                operation,
                rows,
                cols,
                req.max_value.unwrap_or(10),
                req.seed.unwrap_or_else(rand_seed),
            )
        }
        _ => return Err(bad("give both a and b, or rows and cols".to_string())),
    };
    let dims = result_dims(operation, &a, &b).map_err(|e| bad(e.to_string()))?;
    check_elements(dims.rows, dims.cols, max_elements).map_err(|e| bad(e.to_string()))?;

    let mut run = ComputationRun::new(operation, a, b);
    if let Some(k) = req.chunk_rows {
        run = run.with_chunk_rows(k);
    }
    if let Some(secs) = req.budget_secs.filter(|s| *s > 0) {
        run = run.with_budget(Duration::from_secs(secs));
    }
    Ok(run)
}

fn rand_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ── /runs/{id}/cancel (POST) ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CancelResponse {
    pub run_id: String,
    pub cancelled: bool,
}

pub async fn handle_run_cancel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    if state.runs.get(&id).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("no run {id}")));
    }
    if !state.runs.cancel(&id) {
        return Err((StatusCode::CONFLICT, format!("run {id} already finished")));
    }
    tracing::info!(run_id = %id, "run cancel requested");
    Ok(Json(CancelResponse {
        run_id: id,
        cancelled: true,
    }))
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn run_to_json(r: RunRecord, with_result: bool) -> RunJson {
    RunJson {
        run_id: r.id,
        operation: r.operation,
        a: r.a.to_string(),
        b: r.b.to_string(),
        state: r.state,
        expected: r.expected,
        collected: r.collected,
        missing: r.missing,
        error: r.error,
        submitted_at: r.submitted_at,
        updated_at: r.updated_at,
        result: if with_result { r.result } else { None },
    }
}
