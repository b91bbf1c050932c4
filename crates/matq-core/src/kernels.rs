//! Compute kernels. The only arithmetic a worker performs.

use crate::error::MatqError;
use crate::matrix::Matrix;
use crate::wire::Operation;

/// Elementwise sum. Both operands must have identical dimensions.
pub fn add(a: &Matrix, b: &Matrix) -> Result<Matrix, MatqError> {
    if a.dims() != b.dims() {
        return Err(MatqError::ShapeMismatch {
            operation: Operation::Addition,
            left: a.dims(),
            right: b.dims(),
        });
    }
    let data = a
        .as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(x, y)| x + y)
        .collect();
    Ok(Matrix::from_parts(a.rows(), a.cols(), data))
}

/// Standard matrix product. Requires `a.cols() == b.rows()`.
pub fn dot(a: &Matrix, b: &Matrix) -> Result<Matrix, MatqError> {
    if a.cols() != b.rows() {
        return Err(MatqError::ShapeMismatch {
            operation: Operation::Multiplication,
            left: a.dims(),
            right: b.dims(),
        });
    }
    let (n, m, p) = (a.rows(), a.cols(), b.cols());
    let lhs = a.as_slice();
    let rhs = b.as_slice();
    let mut data = vec![0.0; n * p];
    for i in 0..n {
        for j in 0..p {
            let mut sum = 0.0;
            for k in 0..m {
                sum += lhs[i * m + k] * rhs[k * p + j];
            }
            data[i * p + j] = sum;
        }
    }
    Ok(Matrix::from_parts(n, p, data))
}

/// Run `operation`. A result holding an infinity or NaN is an error, since
/// JSON cannot carry it to the collector.
pub fn apply(operation: Operation, a: &Matrix, b: &Matrix) -> Result<Matrix, MatqError> {
    let result = match operation {
        Operation::Addition => add(a, b)?,
        Operation::Multiplication => dot(a, b)?,
    };
    if !result.as_slice().iter().all(|v| v.is_finite()) {
        return Err(MatqError::NonFinite { operation });
    }
    Ok(result)
}
