//! Failure paths: timeouts, poison messages, broker faults, cancellation.

use std::time::Duration;

use crate::*;

use matq_core::kernels;
use matq_core::{Dims, Matrix, MatqError, Operation};
use matq_services::{ComputationRun, RunState};

/// With only slot 0 served, the run times out missing exactly the odd
/// indices. Bringing up slot 1 and collecting again finishes it.
#[tokio::test]
async fn test_timeout_reports_missing_then_resumes() {
    let cluster = Cluster::idle(&test_config(2)).await.unwrap();
    cluster.deploy(0).await.unwrap();

    let a = Matrix::sequential(4, 4);
    let b = Matrix::identity(4);
    let run = ComputationRun::new(Operation::Multiplication, a.clone(), b)
        .with_chunk_rows(1)
        .with_budget(Duration::from_millis(500));
    let id = run.id.clone();
    let mut active = cluster.coordinator.start(run).await.unwrap();

    let err = active.collect().await.unwrap_err();
    assert!(matches!(err.kind, MatqError::TimedOut { expected: 4, .. }));
    assert_eq!(err.missing(), Some(&[1, 3][..]));
    assert_eq!(active.collector().collected_count(), 2);
    let record = cluster.runs().get(&id).unwrap();
    assert_eq!(record.state, RunState::TimedOut);
    assert_eq!(record.missing, vec![1, 3]);

    cluster.deploy(1).await.unwrap();
    active.set_budget(Duration::from_secs(10));
    let result = active.collect().await.unwrap();
    assert_eq!(result, a);
    assert_eq!(cluster.runs().get(&id).unwrap().state, RunState::Complete);

    cluster.shutdown().await.unwrap();
}

/// A ragged task is never acknowledged, so it stays on the queue.
#[tokio::test]
async fn test_ragged_task_never_acknowledged() {
    let cluster = Cluster::start(&test_config(1)).await.unwrap();
    let input = cluster.topology().input_queue(0);

    publish_raw(
        &cluster.broker,
        &input,
        br#"{"op":"add","index":0,"a":[[1,2],[3]],"b":[[1,2],[3,4]]}"#,
    )
    .await
    .unwrap();

    let stats = cluster.pool.registry().get(0).unwrap();
    let s = stats.clone();
    wait_until(Duration::from_secs(5), || {
        let s = s.clone();
        async move { s.snapshot(0).malformed >= 1 }
    })
    .await
    .unwrap();

    assert_eq!(stats.processed(), 0);
    assert_eq!(cluster.broker.depth(&input).unwrap().in_flight, 1);
    let result_queue = cluster.topology().result_queue(0);
    assert_eq!(cluster.broker.depth(&result_queue).unwrap().ready, 0);

    cluster.shutdown().await.unwrap();
}

/// A poison task is dead-lettered after the configured number of receives.
#[tokio::test]
async fn test_poison_task_dead_lettered() {
    let mut config = test_config(1);
    config.queue.visibility_timeout_ms = 50;
    config.queue.max_receive_count = 2;
    let cluster = Cluster::start(&config).await.unwrap();
    let input = cluster.topology().input_queue(0);

    publish_raw(&cluster.broker, &input, b"not json").await.unwrap();

    let broker = cluster.broker.clone();
    let queue = input.clone();
    wait_until(Duration::from_secs(5), || {
        let broker = broker.clone();
        let queue = queue.clone();
        async move { !broker.dead_letters(&queue).is_empty() }
    })
    .await
    .unwrap();

    assert_eq!(cluster.broker.dead_letters(&input), vec![bytes::Bytes::from_static(b"not json")]);
    let depth = cluster.broker.depth(&input).unwrap();
    assert_eq!(depth.ready + depth.in_flight, 0);
    assert_eq!(cluster.pool.registry().get(0).unwrap().snapshot(0).malformed, 2);

    cluster.shutdown().await.unwrap();
}

/// Transient publish failures on the worker are retried and the task is
/// acknowledged once the completion goes out.
#[tokio::test]
async fn test_worker_publish_retried_then_acked() {
    let cluster = Cluster::idle(&test_config(1)).await.unwrap();

    let a = Matrix::sequential(2, 2);
    let run = ComputationRun::new(Operation::Addition, a.clone(), a.clone());
    let mut active = cluster.coordinator.start(run).await.unwrap();

    cluster.broker.fail_next_publishes(2);
    cluster.deploy(0).await.unwrap();

    let result = active.collect().await.unwrap();
    assert_eq!(result, kernels::add(&a, &a).unwrap());

    let snapshot = cluster.pool.registry().get(0).unwrap().snapshot(0);
    assert_eq!(snapshot.publish_retries, 2);
    assert_eq!(snapshot.publish_failures, 0);
    assert_eq!(snapshot.processed, 1);
    let input = cluster.topology().input_queue(0);
    assert_eq!(cluster.broker.depth(&input).unwrap().in_flight, 0);

    cluster.shutdown().await.unwrap();
}

/// When the worker gives up publishing, the task is left unacknowledged and
/// a later delivery completes it.
#[tokio::test]
async fn test_exhausted_publish_redelivered() {
    let mut config = test_config(1);
    config.queue.visibility_timeout_ms = 200;
    config.retry.max_attempts = 2;
    let cluster = Cluster::idle(&config).await.unwrap();

    let a = Matrix::sequential(3, 3);
    let run = ComputationRun::new(Operation::Multiplication, a.clone(), a.clone());
    let mut active = cluster.coordinator.start(run).await.unwrap();

    cluster.broker.fail_next_publishes(2);
    cluster.deploy(0).await.unwrap();

    let result = active.collect().await.unwrap();
    assert_eq!(result, kernels::dot(&a, &a).unwrap());

    let snapshot = cluster.pool.registry().get(0).unwrap().snapshot(0);
    assert_eq!(snapshot.publish_failures, 1);
    assert_eq!(snapshot.processed, 1);

    cluster.shutdown().await.unwrap();
}

/// Cancelling a dispatched run with no workers reports every index missing.
#[tokio::test]
async fn test_cancel_reports_all_missing() {
    let cluster = Cluster::idle(&test_config(2)).await.unwrap();

    let a = Matrix::sequential(4, 2);
    let run = ComputationRun::new(Operation::Addition, a.clone(), a).with_chunk_rows(1);
    let id = run.id.clone();
    let mut active = cluster.coordinator.start(run).await.unwrap();

    let runs = cluster.runs().clone();
    let cancel_id = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runs.cancel(&cancel_id));
    });

    let err = active.collect().await.unwrap_err();
    assert_eq!(
        err.kind,
        MatqError::Cancelled {
            expected: 4,
            missing: vec![0, 1, 2, 3]
        }
    );
    assert_eq!(cluster.runs().get(&id).unwrap().state, RunState::Cancelled);
    assert!(!cluster.runs().cancel(&id));

    cluster.shutdown().await.unwrap();
}

/// Incompatible operands fail before anything is dispatched, and the error
/// names the operation and both shapes.
#[tokio::test]
async fn test_shape_mismatch_reported() {
    let cluster = Cluster::start(&test_config(2)).await.unwrap();

    let run = ComputationRun::new(
        Operation::Multiplication,
        Matrix::zeros(2, 3),
        Matrix::zeros(2, 3),
    );
    let id = run.id.clone();
    let err = cluster.coordinator.execute(run).await.unwrap_err();

    assert_eq!(
        err.kind,
        MatqError::ShapeMismatch {
            operation: Operation::Multiplication,
            left: Dims::new(2, 3),
            right: Dims::new(2, 3),
        }
    );
    assert!(err.to_string().contains("multiply of 2x3 by 2x3"));
    assert_eq!(cluster.runs().get(&id).unwrap().state, RunState::Failed);
    for queue in cluster.topology().all_queues() {
        assert_eq!(cluster.broker.depth(&queue).unwrap().ready, 0);
    }

    cluster.shutdown().await.unwrap();
}

/// A broker that keeps failing surfaces as `QueueUnavailable` once retries
/// run out.
#[tokio::test]
async fn test_persistent_broker_failure_surfaces() {
    let mut config = test_config(1);
    config.retry.max_attempts = 3;
    let cluster = Cluster::idle(&config).await.unwrap();

    cluster.broker.fail_next_publishes(100);
    let a = Matrix::sequential(2, 2);
    let err = cluster
        .coordinator
        .execute(ComputationRun::new(Operation::Addition, a.clone(), a))
        .await
        .unwrap_err();

    assert!(matches!(err.kind, MatqError::QueueUnavailable { ref queue, .. } if queue == "queue0"));
    assert_eq!(cluster.runs().get(&err.run_id).unwrap().state, RunState::Failed);

    cluster.shutdown().await.unwrap();
}
