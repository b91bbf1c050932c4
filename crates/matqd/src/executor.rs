//! Takes submitted runs off the channel and executes them
//! one at a time, so two runs never share the slot queues.

use tokio::sync::{broadcast, mpsc};

use matq_services::{ComputationRun, Coordinator, QueueClient};

pub async fn run<Q: QueueClient>(
    coordinator: Coordinator<Q>,
    mut submit_rx: mpsc::Receiver<ComputationRun>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(slots = coordinator.topology().slots(), "run executor started");

    loop {
        let run = tokio::select! {
            _ = shutdown.recv() => break,
            next = submit_rx.recv() => match next {
                Some(run) => run,
                None => break,
            },
        };

        let run_id = run.id.clone();
        if coordinator.runs().is_cancelled(&run_id) {
            tracing::info!(run_id = %run_id, "skipping run cancelled before start");
            continue;
        }

        tokio::select! {
            outcome = coordinator.execute(run) => match outcome {
                Ok(result) => {
                    tracing::info!(run_id = %run_id, dims = %result.dims(), "run finished");
                }
                Err(failure) => {
                    tracing::warn!(run_id = %run_id, error = %failure, "run did not complete");
                }
            },
            _ = shutdown.recv() => {
                coordinator.runs().cancel(&run_id);
                tracing::info!(run_id = %run_id, "run interrupted by shutdown");
                break;
            }
        }
    }

    tracing::info!("run executor stopped");
}
