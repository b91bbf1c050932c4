//! `run` — execute one operation with broker, workers and coordinator all
//! inside this process, then check the merged result against a direct
//! computation.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use matq_core::config::MatqConfig;
use matq_core::kernels;
use matq_core::partition::{DEFAULT_MAX_ELEMENTS, check_random_shape, random_operands};
use matq_core::Operation;
use matq_services::{
    BrokerSettings, ComputationRun, Coordinator, LocalPool, MemoryBroker, NodeLifecycle,
    RetryPolicy, RunStore, WorkerRegistry, bootstrap,
};

/// Options shared by `run` and `submit`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunArgs {
    pub operation: Operation,
    pub rows: usize,
    pub cols: usize,
    pub workers: usize,
    pub chunk_rows: Option<usize>,
    pub seed: Option<u64>,
    pub max_value: u32,
    pub budget_secs: Option<u64>,
    /// Refuse shapes with more cells than this per matrix.
    pub max_elements: usize,
    /// Write the result here instead of printing it.
    pub output: Option<PathBuf>,
}

fn value<T: FromStr>(args: &[&str], i: usize, flag: &str) -> Result<T> {
    let raw = args
        .get(i)
        .with_context(|| format!("{flag} requires a value"))?;
    raw.parse()
        .map_err(|_| anyhow::anyhow!("{flag} got invalid value {raw:?}"))
}

impl RunArgs {
    pub fn parse(args: &[&str]) -> Result<Self> {
        let mut operation = None;
        let mut rows = None;
        let mut cols = None;
        let mut workers = None;
        let mut out = RunArgs {
            operation: Operation::Addition,
            rows: 0,
            cols: 0,
            workers: 0,
            chunk_rows: None,
            seed: None,
            max_value: 10,
            budget_secs: None,
            max_elements: DEFAULT_MAX_ELEMENTS,
            output: None,
        };

        let mut i = 0;
        while i < args.len() {
            let flag = args[i];
            match flag {
                "--output" => {
                    i += 1;
                    out.output = Some(value(args, i, flag)?);
                }
                "--operation" | "-o" => {
                    i += 1;
                    let raw: String = value(args, i, flag)?;
                    operation = Some(Operation::from_str(&raw)?);
                }
                "--rows" | "-r" => {
                    i += 1;
                    rows = Some(value(args, i, flag)?);
                }
                "--cols" | "-c" => {
                    i += 1;
                    cols = Some(value(args, i, flag)?);
                }
                "--workers" | "-w" => {
                    i += 1;
                    workers = Some(value(args, i, flag)?);
                }
                "--chunk-rows" => {
                    i += 1;
                    out.chunk_rows = Some(value(args, i, flag)?);
                }
                "--seed" => {
                    i += 1;
                    out.seed = Some(value(args, i, flag)?);
                }
                "--max-value" => {
                    i += 1;
                    out.max_value = value(args, i, flag)?;
                }
                "--budget-secs" => {
                    i += 1;
                    out.budget_secs = Some(value(args, i, flag)?);
                }
                "--max-elements" => {
                    i += 1;
                    out.max_elements = value(args, i, flag)?;
                }
                other => bail!("unknown option {other}"),
            }
            i += 1;
        }

        out.operation = operation.context("--operation is required")?;
        out.rows = rows.context("--rows is required")?;
        out.cols = cols.context("--cols is required")?;
        out.workers = workers.unwrap_or(1);
        if out.rows == 0 || out.cols == 0 {
            bail!("--rows and --cols must be at least 1");
        }
        if out.workers == 0 {
            bail!("--workers must be at least 1");
        }
        check_random_shape(out.operation, out.rows, out.cols, out.max_elements)?;
        Ok(out)
    }
}

pub async fn cmd_run(args: &RunArgs) -> Result<()> {
    let mut config = MatqConfig::load().unwrap_or_default();
    config.workers.slots = args.workers;
    config.workers.poll_wait_ms = config.workers.poll_wait_ms.min(100);
    config.collector.poll_wait_ms = config.collector.poll_wait_ms.min(100);
    let retry = RetryPolicy::from(&config.retry);

    let broker = MemoryBroker::new(BrokerSettings::from(&config.queue));
    let coordinator = Coordinator::new(broker.clone(), &config, RunStore::new());
    let topology = coordinator.topology().clone();
    topology.create_all(&broker, &retry).await?;

    let pool = LocalPool::new(
        broker.clone(),
        topology.clone(),
        config.workers.clone(),
        retry.clone(),
        WorkerRegistry::default(),
    );
    bootstrap(&pool, args.workers).await?;

    let seed = args.seed.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    });
    let (a, b) = random_operands(args.operation, args.rows, args.cols, args.max_value, seed);

    let mut run = ComputationRun::new(args.operation, a.clone(), b.clone());
    if let Some(k) = args.chunk_rows {
        run = run.with_chunk_rows(k);
    }
    if let Some(secs) = args.budget_secs {
        run = run.with_budget(Duration::from_secs(secs));
    }

    let started = Instant::now();
    let outcome = coordinator.execute(run).await;
    let elapsed = started.elapsed();

    pool.terminate_all().await?;
    topology.delete_all(&broker, &retry).await;

    let result = outcome?;
    let direct = kernels::apply(args.operation, &a, &b)?;
    let matches = result == direct;

    println!("═══════════════════════════════════════");
    println!("  Distributed {}", args.operation);
    println!("═══════════════════════════════════════");
    println!("  A       : {}", a.dims());
    println!("  B       : {}", b.dims());
    println!("  Result  : {}", result.dims());
    println!("  Workers : {}", args.workers);
    println!("  Seed    : {}", seed);
    println!("  Elapsed : {:.3}s", elapsed.as_secs_f64());
    println!("  Matches direct computation: {}", if matches { "yes" } else { "no" });

    if !matches {
        bail!("distributed result differs from direct computation");
    }

    match &args.output {
        Some(path) => {
            std::fs::write(path, result.to_string())
                .with_context(|| format!("failed to write result to {}", path.display()))?;
            println!("  Written : {}", path.display());
        }
        None => print!("\n{}", result),
    }
    Ok(())
}
