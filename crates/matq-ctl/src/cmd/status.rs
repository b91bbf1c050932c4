//! Daemon status, queue depths and shutdown.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatusResponse {
    uptime_secs: u64,
    slots: usize,
    workers: Vec<WorkerInfo>,
    runs: RunCounts,
}

#[derive(Deserialize)]
struct WorkerInfo {
    slot: usize,
    state: String,
    processed: u64,
    malformed: u64,
    publish_retries: u64,
    publish_failures: u64,
}

#[derive(Deserialize)]
struct RunCounts {
    pending: usize,
    active: usize,
    complete: usize,
    timed_out: usize,
    cancelled: usize,
    failed: usize,
}

#[derive(Deserialize)]
struct QueuesResponse {
    queues: Vec<QueueInfo>,
}

#[derive(Deserialize)]
struct QueueInfo {
    name: String,
    exists: bool,
    ready: usize,
    in_flight: usize,
    dead: usize,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  matqd Status");
    println!("═══════════════════════════════════════");
    println!("  Uptime      : {}s", resp.uptime_secs);
    println!("  Slots       : {}", resp.slots);
    println!(
        "  Runs        : {} pending, {} active, {} complete",
        resp.runs.pending, resp.runs.active, resp.runs.complete
    );
    println!(
        "                {} timed out, {} cancelled, {} failed",
        resp.runs.timed_out, resp.runs.cancelled, resp.runs.failed
    );

    if resp.workers.is_empty() {
        println!("\n  No workers running.");
    } else {
        println!("\n  Workers:");
        for w in &resp.workers {
            println!("  ┌─ slot {}", w.slot);
            println!("  │  state     : {}", w.state);
            println!("  │  processed : {}", w.processed);
            println!("  │  malformed : {}", w.malformed);
            println!(
                "  └─ publish   : {} retries, {} failures",
                w.publish_retries, w.publish_failures
            );
        }
    }

    Ok(())
}

pub async fn cmd_queues(port: u16) -> Result<()> {
    let resp: QueuesResponse = get_json(&format!("{}/queues", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Queues ({})", resp.queues.len());
    println!("═══════════════════════════════════════");
    for q in &resp.queues {
        if q.exists {
            println!(
                "  {:<24} ready {:>5}  in flight {:>5}  dead {:>4}",
                q.name, q.ready, q.in_flight, q.dead
            );
        } else {
            println!("  {:<24} (missing)", q.name);
        }
    }

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
