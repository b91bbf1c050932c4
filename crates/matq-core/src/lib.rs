//! matq-core — shared types, wire format, kernels, and configuration.
//! All other matq crates depend on this one.

pub mod config;
pub mod error;
pub mod kernels;
pub mod matrix;
pub mod partition;
pub mod wire;

pub use error::MatqError;
pub use matrix::{Dims, Matrix};
pub use partition::Partition;
pub use wire::{CompletionMessage, Operation, TaskMessage};
