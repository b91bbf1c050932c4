//! Queue message schemas.
//!
//! Task queue:   `{"op": "add"|"multiply", "index": <int>, "a": <matrix>, "b": <matrix>, "run": <id>}`
//! Result queue: `{"index": <int>, "result": <matrix>, "run": <id>}`
//!
//! `run` names the run a message belongs to. Workers copy it from the task
//! into the completion, and the collector drops completions from any other
//! run. It is omitted when empty.
//!
//! Matrices are nested JSON arrays, rectangular, row-major. Decoding is plain
//! serde with rectangularity enforced by `Matrix`'s `Deserialize` impl; any
//! failure maps to a typed error and nothing in a body is ever evaluated.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MatqError;
use crate::matrix::Matrix;

/// Operation a task asks the worker to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "add")]
    Addition,
    #[serde(rename = "multiply")]
    Multiplication,
}

impl Operation {
    /// Wire tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Addition => "add",
            Self::Multiplication => "multiply",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, MatqError> {
        match tag {
            "add" => Ok(Self::Addition),
            "multiply" => Ok(Self::Multiplication),
            other => Err(MatqError::UnknownOperation(other.to_string())),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Accepts the wire tags plus the long names used on the command line.
impl FromStr for Operation {
    type Err = MatqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" | "addition" => Ok(Self::Addition),
            "multiply" | "multiplication" | "dot" => Ok(Self::Multiplication),
            other => Err(MatqError::UnknownOperation(other.to_string())),
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

/// One chunk pair plus the operation, addressed by index.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub op: Operation,
    pub index: usize,
    pub a: Matrix,
    pub b: Matrix,
    pub run: String,
}

/// Task as read off the wire, before the op tag is resolved. Keeping `op` as
/// a string lets an unknown tag surface as `UnknownOperation` rather than a
/// generic parse failure.
#[derive(Deserialize)]
struct RawTask {
    op: String,
    index: usize,
    a: Matrix,
    b: Matrix,
    #[serde(default)]
    run: String,
}

/// Borrowed view used when encoding straight from partition blocks.
#[derive(Serialize)]
struct TaskRef<'a> {
    op: Operation,
    index: usize,
    a: &'a Matrix,
    b: &'a Matrix,
    #[serde(skip_serializing_if = "no_run")]
    run: &'a str,
}

fn no_run(run: &&str) -> bool {
    run.is_empty()
}

/// Encode a task for `run` without taking ownership of its operands.
pub fn encode_task(
    run: &str,
    op: Operation,
    index: usize,
    a: &Matrix,
    b: &Matrix,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&TaskRef { op, index, a, b, run })
}

impl TaskMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        encode_task(&self.run, self.op, self.index, &self.a, &self.b)
    }

    pub fn decode(body: &[u8]) -> Result<Self, MatqError> {
        let raw: RawTask =
            serde_json::from_slice(body).map_err(|e| MatqError::MalformedTask(e.to_string()))?;
        Ok(Self {
            op: Operation::from_tag(&raw.op)?,
            index: raw.index,
            a: raw.a,
            b: raw.b,
            run: raw.run,
        })
    }
}

// ── Completion ────────────────────────────────────────────────────────────────

/// Result of one task, addressed by the same index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub index: usize,
    pub result: Matrix,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run: String,
}

impl CompletionMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, MatqError> {
        serde_json::from_slice(body).map_err(|e| MatqError::MalformedCompletion(e.to_string()))
    }
}
