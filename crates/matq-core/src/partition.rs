//! Matrix partitioner — splits an operation into row-indexed chunk pairs.
//!
//! Addition pairs row block `i` of A with row block `i` of B. Multiplication
//! pairs row block `i` of A with the whole of B, so each chunk yields the
//! matching row block of the product. Index `i` is the block position and is
//! the only thing needed to put the result back together.

use std::ops::Range;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::MatqError;
use crate::matrix::{Dims, Matrix};
use crate::wire::Operation;

/// One unit of distributed work.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub index: usize,
    pub a: Matrix,
    pub b: Matrix,
    /// Shape the worker's result chunk must have.
    pub expected: Dims,
}

/// Largest operand or result accepted by default, in cells.
pub const DEFAULT_MAX_ELEMENTS: usize = 16_000_000;

/// Fail unless a `rows`×`cols` matrix fits in `limit` cells.
pub fn check_elements(rows: usize, cols: usize, limit: usize) -> Result<(), MatqError> {
    match rows.checked_mul(cols) {
        Some(n) if n <= limit => Ok(()),
        _ => Err(MatqError::TooLarge { rows, cols, limit }),
    }
}

/// Bound every matrix `random_operands` would build for these arguments,
/// and the result. Call before generating anything.
pub fn check_random_shape(
    operation: Operation,
    rows: usize,
    cols: usize,
    limit: usize,
) -> Result<(), MatqError> {
    check_elements(rows, cols, limit)?;
    if operation == Operation::Multiplication {
        check_elements(cols, cols, limit)?;
    }
    Ok(())
}

/// Validate operand shapes and return the dimensions of the full result.
pub fn result_dims(operation: Operation, a: &Matrix, b: &Matrix) -> Result<Dims, MatqError> {
    for m in [a, b] {
        if m.is_empty() {
            return Err(MatqError::EmptyMatrix(m.dims()));
        }
    }
    let compatible = match operation {
        Operation::Addition => a.dims() == b.dims(),
        Operation::Multiplication => a.cols() == b.rows(),
    };
    if !compatible {
        return Err(MatqError::ShapeMismatch {
            operation,
            left: a.dims(),
            right: b.dims(),
        });
    }
    Ok(match operation {
        Operation::Addition => a.dims(),
        Operation::Multiplication => Dims::new(a.rows(), b.cols()),
    })
}

/// Number of chunks for `rows` rows on `slots` workers.
///
/// With an explicit `chunk_rows` the count is `ceil(rows / chunk_rows)`,
/// otherwise one chunk per slot. Always within `1..=rows` (or 1 for 0 rows).
pub fn chunk_count(rows: usize, slots: usize, chunk_rows: Option<usize>) -> usize {
    let wanted = match chunk_rows {
        Some(k) if k > 0 => rows.div_ceil(k),
        _ => slots,
    };
    wanted.clamp(1, rows.max(1))
}

/// Split `0..rows` into `chunks` contiguous ranges. The first `rows % chunks`
/// ranges carry one extra row.
pub fn row_blocks(rows: usize, chunks: usize) -> Vec<Range<usize>> {
    let chunks = chunks.clamp(1, rows.max(1));
    let base = rows / chunks;
    let extra = rows % chunks;
    let mut out = Vec::with_capacity(chunks);
    let mut start = 0;
    for i in 0..chunks {
        let len = base + usize::from(i < extra);
        out.push(start..start + len);
        start += len;
    }
    out
}

/// Partition `a op b` into `chunks` row-aligned pieces indexed `0..T`.
pub fn partition(
    operation: Operation,
    a: &Matrix,
    b: &Matrix,
    chunks: usize,
) -> Result<Vec<Partition>, MatqError> {
    let result = result_dims(operation, a, b)?;

    let parts = row_blocks(a.rows(), chunks)
        .into_iter()
        .enumerate()
        .map(|(index, range)| {
            let expected = Dims::new(range.len(), result.cols);
            let a_block = a.row_block(range.clone());
            let b_block = match operation {
                Operation::Addition => b.row_block(range),
                Operation::Multiplication => b.clone(),
            };
            Partition {
                index,
                a: a_block,
                b: b_block,
                expected,
            }
        })
        .collect();
    Ok(parts)
}

/// Random operands for `operation` on an `rows`×`cols` left matrix with
/// integer entries in `0..max_value`. B matches A for addition and is
/// `cols`×`cols` for multiplication.
pub fn random_operands(
    operation: Operation,
    rows: usize,
    cols: usize,
    max_value: u32,
    seed: u64,
) -> (Matrix, Matrix) {
    let mut rng = StdRng::seed_from_u64(seed);
    let a = Matrix::random(rows, cols, max_value, &mut rng);
    let b = match operation {
        Operation::Addition => Matrix::random(rows, cols, max_value, &mut rng),
        Operation::Multiplication => Matrix::random(cols, cols, max_value, &mut rng),
    };
    (a, b)
}
