//! Dense row-major matrix of `f64`.
//!
//! On the wire a matrix is a JSON array of rows, each row an array of
//! numbers. Deserialization rejects ragged input, so every `Matrix` value is
//! rectangular by construction.

use std::fmt;
use std::ops::Range;

use rand::Rng;
use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MatqError;

/// Row and column count of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dims {
    pub rows: usize,
    pub cols: usize,
}

impl Dims {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn elements(&self) -> usize {
        self.rows * self.cols
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build a matrix by evaluating `f(row, col)` for every cell.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    /// Build from nested rows. Every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, MatqError> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (row, values) in rows.iter().enumerate() {
            if values.len() != cols {
                return Err(MatqError::RaggedRows {
                    row,
                    expected: cols,
                    found: values.len(),
                });
            }
            data.extend_from_slice(values);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// `rows x cols` filled with 1, 2, 3, … in row-major order.
    pub fn sequential(rows: usize, cols: usize) -> Self {
        Self::from_fn(rows, cols, |r, c| (r * cols + c + 1) as f64)
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |r, c| if r == c { 1.0 } else { 0.0 })
    }

    /// Random integer-valued matrix with entries in `0..max_value`.
    pub fn random<R: Rng>(rows: usize, cols: usize, max_value: u32, rng: &mut R) -> Self {
        let bound = max_value.max(1);
        Self::from_fn(rows, cols, |_, _| rng.gen_range(0..bound) as f64)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn dims(&self) -> Dims {
        Dims::new(self.rows, self.cols)
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        Some(self.data[row * self.cols + col])
    }

    /// Row `r` as a slice. Panics if `r` is out of bounds.
    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.rows).map(|r| self.row(r).to_vec()).collect()
    }

    /// Copy of the contiguous rows in `range`. Panics if the range exceeds `rows()`.
    pub fn row_block(&self, range: Range<usize>) -> Matrix {
        let rows = range.len();
        let data = self.data[range.start * self.cols..range.end * self.cols].to_vec();
        Matrix {
            rows,
            cols: self.cols,
            data,
        }
    }

    /// Concatenate row blocks top to bottom. All blocks must share a width.
    pub fn vstack<'a, I>(blocks: I) -> Result<Matrix, MatqError>
    where
        I: IntoIterator<Item = &'a Matrix>,
    {
        let mut out: Option<Matrix> = None;
        for (block, m) in blocks.into_iter().enumerate() {
            match out.as_mut() {
                None => out = Some(m.clone()),
                Some(acc) => {
                    if m.cols != acc.cols {
                        return Err(MatqError::BlockWidth {
                            block,
                            expected: acc.cols,
                            found: m.cols,
                        });
                    }
                    acc.data.extend_from_slice(&m.data);
                    acc.rows += m.rows;
                }
            }
        }
        Ok(out.unwrap_or_else(|| Matrix::zeros(0, 0)))
    }

    pub(crate) fn from_parts(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }
}

/// One row per line, values separated by a single space.
impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in 0..self.rows {
            for (c, value) in self.row(r).iter().enumerate() {
                if c > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{}", value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl Serialize for Matrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows))?;
        for r in 0..self.rows {
            seq.serialize_element(self.row(r))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<Vec<f64>>::deserialize(deserializer)?;
        Matrix::from_rows(rows).map_err(D::Error::custom)
    }
}
