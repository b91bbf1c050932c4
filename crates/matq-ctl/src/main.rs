//! matq-ctl — command-line interface for distributed matrix runs.

use anyhow::{Context, Result};

mod cmd;

use cmd::run::RunArgs;

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: matq-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  run <options>        Run one operation locally and verify the result");
    println!("  submit <options>     Submit a run to matqd");
    println!("  runs                 List runs known to matqd");
    println!("  runs <id>            Show one run, with its result when complete");
    println!("  cancel <id>          Cancel a pending or active run");
    println!("  status               Show daemon status and worker counters");
    println!("  queues               Show slot queue depths");
    println!("  shutdown             Stop the daemon");
    println!();
    println!("Run options:");
    println!("  --operation <add|multiply>  Operation (required)");
    println!("  --rows <n> --cols <n>       Shape of A (required); B is rows×cols for add,");
    println!("                              cols×cols for multiply");
    println!("  --workers <n>               Worker slots for a local run (default: 1)");
    println!("  --chunk-rows <n>            Rows per chunk (default: one chunk per slot)");
    println!("  --seed <n>                  Seed for random operands");
    println!("  --max-value <n>             Entries drawn from 0..n (default: 10)");
    println!("  --budget-secs <n>           Collect budget (default: sized from the result)");
    println!("  --max-elements <n>          Largest matrix accepted, in cells (default: 16000000)");
    println!("  --output <path>             Write the result matrix to a file (run only)");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["run", rest @ ..] => cmd::run::cmd_run(&RunArgs::parse(rest)?).await,
        ["submit", rest @ ..] => cmd::runs::cmd_submit(port, &RunArgs::parse(rest)?).await,
        ["runs"] => cmd::runs::cmd_runs(port).await,
        ["runs", id] => cmd::runs::cmd_run_inspect(port, id).await,
        ["cancel", id] => cmd::runs::cmd_cancel(port, id).await,
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["queues"] => cmd::status::cmd_queues(port).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            print_usage();
            std::process::exit(1);
        }
    }
}
