//! End-to-end runs through dispatcher, workers and collector.

use crate::*;

use matq_core::kernels;
use matq_core::partition::random_operands;
use matq_core::{Matrix, Operation};
use matq_services::{ComputationRun, RunState};

fn matrix(rows: &[&[f64]]) -> Matrix {
    Matrix::from_rows(rows.iter().map(|r| r.to_vec()).collect()).unwrap()
}

/// A 2x2 addition on a single worker goes out as one chunk.
#[tokio::test]
async fn test_small_addition_single_worker() {
    let cluster = Cluster::start(&test_config(1)).await.unwrap();

    let a = matrix(&[&[1.0, 2.0], &[3.0, 4.0]]);
    let b = matrix(&[&[5.0, 6.0], &[7.0, 8.0]]);
    let run = ComputationRun::new(Operation::Addition, a, b);
    let id = run.id.clone();

    let result = cluster.coordinator.execute(run).await.unwrap();
    assert_eq!(result, matrix(&[&[6.0, 8.0], &[10.0, 12.0]]));

    let record = cluster.runs().get(&id).unwrap();
    assert_eq!(record.state, RunState::Complete);
    assert_eq!(record.expected, 1);
    assert_eq!(record.collected, 1);

    cluster.shutdown().await.unwrap();
}

/// A 4x4 product split into two-row chunks across two workers.
#[tokio::test]
async fn test_multiplication_two_workers_two_chunks() {
    let cluster = Cluster::start(&test_config(2)).await.unwrap();

    let a = Matrix::sequential(4, 4);
    let b = Matrix::sequential(4, 4);
    let expected = kernels::dot(&a, &b).unwrap();
    let run = ComputationRun::new(Operation::Multiplication, a, b).with_chunk_rows(2);
    let id = run.id.clone();

    let result = cluster.coordinator.execute(run).await.unwrap();
    assert_eq!(result, expected);
    assert_eq!(cluster.runs().get(&id).unwrap().expected, 2);

    let processed: u64 = cluster
        .pool
        .registry()
        .snapshots()
        .iter()
        .map(|s| s.processed)
        .sum();
    assert_eq!(processed, 2);

    cluster.shutdown().await.unwrap();
}

/// Distributed results equal direct computation for uneven shapes.
#[tokio::test]
async fn test_results_match_direct_computation() {
    let cluster = Cluster::start(&test_config(3)).await.unwrap();

    let cases = [
        (Operation::Addition, 7, 5, None),
        (Operation::Addition, 2, 9, Some(1)),
        (Operation::Multiplication, 10, 3, None),
        (Operation::Multiplication, 5, 6, Some(2)),
        (Operation::Multiplication, 1, 4, None),
    ];
    for (seed, (operation, rows, cols, chunk_rows)) in cases.into_iter().enumerate() {
        let (a, b) = random_operands(operation, rows, cols, 10, seed as u64);
        let expected = kernels::apply(operation, &a, &b).unwrap();
        let mut run = ComputationRun::new(operation, a, b);
        if let Some(k) = chunk_rows {
            run = run.with_chunk_rows(k);
        }
        let result = cluster.coordinator.execute(run).await.unwrap();
        assert_eq!(result, expected, "{operation} {rows}x{cols}");
    }

    cluster.shutdown().await.unwrap();
}

/// Consecutive runs reuse the same queues without leaking results.
#[tokio::test]
async fn test_back_to_back_runs_share_queues() {
    let cluster = Cluster::start(&test_config(2)).await.unwrap();
    let seq = Matrix::sequential(4, 2);

    // Same shapes, different results, so a completion leaking from one run
    // into the next would show up in the merged matrix.
    let first = ComputationRun::new(
        Operation::Addition,
        seq.clone(),
        Matrix::zeros(4, 2),
    )
    .with_chunk_rows(1);
    let second = ComputationRun::new(
        Operation::Addition,
        Matrix::zeros(4, 2),
        Matrix::zeros(4, 2),
    )
    .with_chunk_rows(1);
    let third = ComputationRun::new(
        Operation::Multiplication,
        seq.clone(),
        Matrix::from_fn(2, 2, |r, c| if r == c { 2.0 } else { 0.0 }),
    );

    assert_eq!(
        cluster.coordinator.execute(first).await.unwrap(),
        seq
    );
    assert_eq!(
        cluster.coordinator.execute(second).await.unwrap(),
        Matrix::zeros(4, 2)
    );
    assert_eq!(
        cluster.coordinator.execute(third).await.unwrap(),
        Matrix::from_fn(4, 2, |r, c| 2.0 * seq.row(r)[c])
    );
    assert_eq!(cluster.runs().count_in(RunState::Complete), 3);

    for queue in cluster.topology().all_queues() {
        let depth = cluster.broker.depth(&queue).unwrap();
        assert_eq!(depth.ready + depth.in_flight, 0, "{queue} not drained");
    }

    cluster.shutdown().await.unwrap();
}
