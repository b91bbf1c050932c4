//! Error taxonomy shared by every stage of a run.
//!
//! Only `ShapeMismatch`, `QueueUnavailable` (after retries), `TimedOut` and
//! `Cancelled` ever reach the caller of a run. The malformed-message variants
//! are logged where they happen and the message is left for redelivery.

use crate::matrix::Dims;
use crate::wire::Operation;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatqError {
    #[error("shape mismatch for {operation}: {left} vs {right}")]
    ShapeMismatch {
        operation: Operation,
        left: Dims,
        right: Dims,
    },

    #[error("matrix {0} has no elements")]
    EmptyMatrix(Dims),

    #[error("matrix {rows}x{cols} exceeds the limit of {limit} elements")]
    TooLarge {
        rows: usize,
        cols: usize,
        limit: usize,
    },

    #[error("{operation} produced a non-finite value")]
    NonFinite { operation: Operation },

    #[error("ragged rows: row {row} has {found} columns, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("block {block} has {found} columns, expected {expected}")]
    BlockWidth {
        block: usize,
        expected: usize,
        found: usize,
    },

    #[error("malformed task: {0}")]
    MalformedTask(String),

    #[error("malformed completion: {0}")]
    MalformedCompletion(String),

    #[error("unknown operation {0:?}")]
    UnknownOperation(String),

    #[error("queue {queue} unavailable: {reason}")]
    QueueUnavailable { queue: String, reason: String },

    #[error("timed out with {} of {expected} chunks missing (indices {missing:?})", .missing.len())]
    TimedOut { expected: usize, missing: Vec<usize> },

    #[error("cancelled with {} of {expected} chunks missing", .missing.len())]
    Cancelled { expected: usize, missing: Vec<usize> },
}

impl MatqError {
    /// Indices still outstanding when a run stopped early.
    pub fn missing(&self) -> Option<&[usize]> {
        match self {
            Self::TimedOut { missing, .. } | Self::Cancelled { missing, .. } => Some(missing),
            _ => None,
        }
    }
}
