//! Remote run commands: submit, list, inspect, cancel.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use matq_core::Matrix;

use super::http::{base_url, get_json, post_json, post_json_body};
use super::run::RunArgs;

#[derive(Deserialize)]
struct RunsResponse {
    runs: Vec<RunJson>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct RunJson {
    run_id: String,
    operation: String,
    a: String,
    b: String,
    state: String,
    expected: usize,
    collected: usize,
    #[serde(default)]
    missing: Vec<usize>,
    error: Option<String>,
    submitted_at: u64,
    updated_at: u64,
    result: Option<Matrix>,
}

#[derive(Serialize)]
struct SubmitRunRequest {
    operation: String,
    rows: usize,
    cols: usize,
    seed: Option<u64>,
    max_value: u32,
    chunk_rows: Option<usize>,
    budget_secs: Option<u64>,
}

#[derive(Deserialize)]
struct SubmitRunResponse {
    run_id: String,
    operation: String,
    a: String,
    b: String,
}

#[derive(Deserialize)]
struct CancelResponse {
    run_id: String,
    cancelled: bool,
}

pub async fn cmd_submit(port: u16, args: &RunArgs) -> Result<()> {
    let req = SubmitRunRequest {
        operation: args.operation.tag().to_string(),
        rows: args.rows,
        cols: args.cols,
        seed: args.seed,
        max_value: args.max_value,
        chunk_rows: args.chunk_rows,
        budget_secs: args.budget_secs,
    };
    let resp: SubmitRunResponse =
        post_json_body(&format!("{}/runs", base_url(port)), &req).await?;

    println!("Submitted run {}", resp.run_id);
    println!("  {} of {} by {}", resp.operation, resp.a, resp.b);
    println!("  Check progress with: matq-ctl runs {}", resp.run_id);
    Ok(())
}

pub async fn cmd_runs(port: u16) -> Result<()> {
    let resp: RunsResponse = get_json(&format!("{}/runs", base_url(port))).await?;

    if resp.runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Runs ({})", resp.runs.len());
    println!("═══════════════════════════════════════");
    for r in &resp.runs {
        print_run(r);
    }
    Ok(())
}

pub async fn cmd_run_inspect(port: u16, id: &str) -> Result<()> {
    let run: RunJson = get_json(&format!("{}/runs/{}", base_url(port), id)).await?;
    print_run(&run);
    if let Some(result) = &run.result {
        println!();
        print!("{}", result);
    }
    Ok(())
}

pub async fn cmd_cancel(port: u16, id: &str) -> Result<()> {
    let resp: CancelResponse = post_json(&format!("{}/runs/{}/cancel", base_url(port), id)).await?;
    if resp.cancelled {
        println!("Cancel requested for run {}", resp.run_id);
    }
    Ok(())
}

fn print_run(r: &RunJson) {
    println!("  ┌─ {}", r.run_id);
    println!("  │  operation : {} of {} by {}", r.operation, r.a, r.b);
    println!("  │  chunks    : {}/{}", r.collected, r.expected);
    if !r.missing.is_empty() {
        println!("  │  missing   : {:?}", r.missing);
    }
    if let Some(e) = &r.error {
        println!("  │  error     : {}", e);
    }
    println!("  └─ state     : {}", r.state);
}
