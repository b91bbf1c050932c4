//! At-least-once delivery: duplicates, reordering, redelivery.

use std::time::Duration;

use crate::*;

use matq_core::kernels;
use matq_core::partition::{partition, row_blocks};
use matq_core::{CompletionMessage, Matrix, Operation, TaskMessage};
use matq_services::ComputationRun;

async fn complete(cluster: &Cluster, run: &str, index: usize, result: Matrix) {
    let queue = cluster.topology().result_queue(cluster.topology().slot_for(index));
    let body = CompletionMessage {
        index,
        result,
        run: run.to_string(),
    }
    .encode()
    .unwrap();
    publish_raw(&cluster.broker, &queue, &body).await.unwrap();
}

/// Completions arriving twice and out of order still merge in index order.
#[tokio::test]
async fn test_duplicate_and_shuffled_completions() {
    let cluster = Cluster::idle(&test_config(2)).await.unwrap();

    let a = Matrix::sequential(3, 2);
    let b = Matrix::sequential(3, 2);
    let expected = kernels::add(&a, &b).unwrap();
    let parts = partition(Operation::Addition, &a, &b, 3).unwrap();

    let run = ComputationRun::new(Operation::Addition, a, b).with_chunk_rows(1);
    let mut active = cluster.coordinator.start(run).await.unwrap();

    for index in [2, 0, 2, 1, 0] {
        let p = &parts[index];
        complete(&cluster, active.id(), index, kernels::add(&p.a, &p.b).unwrap()).await;
    }

    let result = active.collect().await.unwrap();
    assert_eq!(result, expected);
    assert_eq!(active.collector().duplicates(), 2);
    assert_eq!(active.collector().rejected(), 0);

    cluster.shutdown().await.unwrap();
}

/// A completion whose shape does not fit its index is rejected and left
/// unacknowledged; the correct one still completes the run.
#[tokio::test]
async fn test_wrong_shape_completion_rejected() {
    let cluster = Cluster::idle(&test_config(1)).await.unwrap();

    let a = Matrix::sequential(2, 2);
    let run = ComputationRun::new(Operation::Addition, a.clone(), a.clone());
    let mut active = cluster.coordinator.start(run).await.unwrap();
    active.set_budget(Duration::from_secs(2));

    let id = active.id().to_string();
    complete(&cluster, &id, 0, Matrix::sequential(1, 2)).await;
    complete(&cluster, &id, 0, kernels::add(&a, &a).unwrap()).await;

    let result = active.collect().await.unwrap();
    assert_eq!(result, kernels::add(&a, &a).unwrap());
    assert!(active.collector().rejected() >= 1);

    cluster.shutdown().await.unwrap();
}

/// A completion from a run that already timed out arrives while the next
/// run of the same shape is collecting. It is dropped, not merged.
#[tokio::test]
async fn test_late_completion_from_timed_out_run_dropped() {
    let cluster = Cluster::idle(&test_config(1)).await.unwrap();

    let a = Matrix::sequential(2, 2);
    let run = ComputationRun::new(Operation::Addition, a.clone(), a.clone());
    let mut first = cluster.coordinator.start(run).await.unwrap();
    first.set_budget(Duration::from_millis(100));

    // A slow worker holds the first run's task past its budget.
    let input = cluster.topology().input_queue(0);
    let held = take_all(&cluster.broker, &input).await.unwrap();
    assert_eq!(held.len(), 1);
    let task = TaskMessage::decode(&held[0].body).unwrap();
    assert_eq!(task.run, first.id());
    let late = kernels::add(&task.a, &task.b).unwrap();
    assert!(first.collect().await.is_err());

    let zeros = Matrix::zeros(2, 2);
    let run = ComputationRun::new(Operation::Addition, zeros.clone(), zeros.clone());
    let mut second = cluster.coordinator.start(run).await.unwrap();
    assert_ne!(second.id(), first.id());

    // The slow worker finishes after the second run has been dispatched.
    complete(&cluster, first.id(), task.index, late).await;
    cluster.deploy(0).await.unwrap();

    let result = second.collect().await.unwrap();
    assert_eq!(result, zeros);
    assert_eq!(second.collector().stale(), 1);
    assert_eq!(second.collector().duplicates(), 0);

    let results = cluster.topology().result_queue(0);
    let depth = cluster.broker.depth(&results).unwrap();
    assert_eq!(depth.ready + depth.in_flight, 0);

    cluster.shutdown().await.unwrap();
}

/// A worker that takes a task and dies leaves it to be redelivered once
/// its visibility timeout lapses.
#[tokio::test]
async fn test_redelivery_after_crashed_worker() {
    let mut config = test_config(1);
    config.queue.visibility_timeout_ms = 200;
    let cluster = Cluster::idle(&config).await.unwrap();

    let a = Matrix::sequential(4, 3);
    let b = Matrix::sequential(3, 2);
    let run = ComputationRun::new(Operation::Multiplication, a.clone(), b.clone());
    let mut active = cluster.coordinator.start(run).await.unwrap();

    // Take the task and never acknowledge it.
    let input = cluster.topology().input_queue(0);
    let stolen = take_all(&cluster.broker, &input).await.unwrap();
    assert_eq!(stolen.len(), 1);
    assert_eq!(TaskMessage::decode(&stolen[0].body).unwrap().index, 0);
    assert_eq!(cluster.broker.depth(&input).unwrap().in_flight, 1);

    cluster.deploy(0).await.unwrap();
    let result = active.collect().await.unwrap();
    assert_eq!(result, kernels::dot(&a, &b).unwrap());

    let stats = cluster.pool.registry().get(0).unwrap();
    assert_eq!(stats.processed(), 1);

    cluster.shutdown().await.unwrap();
}

/// Every index is published exactly once per dispatch and lands on the slot
/// `index mod N`.
#[tokio::test]
async fn test_tasks_assigned_by_index_modulo_slots() {
    let cluster = Cluster::idle(&test_config(3)).await.unwrap();

    let a = Matrix::sequential(7, 2);
    let run = ComputationRun::new(Operation::Addition, a.clone(), a).with_chunk_rows(1);
    let _active = cluster.coordinator.start(run).await.unwrap();

    let mut seen = Vec::new();
    for slot in 0..3 {
        let queue = cluster.topology().input_queue(slot);
        for msg in take_all(&cluster.broker, &queue).await.unwrap() {
            let task = TaskMessage::decode(&msg.body).unwrap();
            assert_eq!(task.index % 3, slot);
            assert_eq!(task.a.rows(), row_blocks(7, 7)[task.index].len());
            seen.push(task.index);
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..7).collect::<Vec<_>>());

    cluster.shutdown().await.unwrap();
}
