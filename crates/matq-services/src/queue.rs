//! Queue service contract.
//!
//! The protocol only assumes what a managed at-least-once queue gives you:
//! named queues, batched publish, receive with a bounded wait, and explicit
//! per-message deletion. Nothing about ordering is assumed, within or across
//! queues. Every component takes a `QueueClient` value; there is no global
//! client.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use matq_core::MatqError;

/// Most entries a single publish may carry, and most messages a single
/// receive may return.
pub const MAX_BATCH: usize = 10;

/// One entry of a publish batch. `id` only has to be unique within the batch.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub id: String,
    pub body: Bytes,
}

/// A delivered message. `receipt` is valid for this delivery only.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: Bytes,
    /// 1 on first delivery, incremented on every redelivery.
    pub receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue {0} does not exist")]
    NoSuchQueue(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("receipt {0} is unknown or expired")]
    ReceiptExpired(String),
    #[error("batch of {0} entries exceeds limit of {MAX_BATCH}")]
    BatchTooLarge(usize),
    #[error("duplicate entry id {0} in batch")]
    DuplicateEntryId(String),
    #[error("empty batch")]
    EmptyBatch,
}

impl QueueError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn into_matq(self, queue: &str) -> MatqError {
        MatqError::QueueUnavailable {
            queue: queue.to_string(),
            reason: self.to_string(),
        }
    }
}

/// Broker operations used by the dispatcher, workers and collector.
pub trait QueueClient: Clone + Send + Sync + 'static {
    /// Create a queue. Creating an existing queue is a no-op.
    fn create_queue(&self, name: &str) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn delete_queue(&self, name: &str) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Drop every message in the queue, visible or in flight.
    fn purge_queue(&self, name: &str) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Publish up to `MAX_BATCH` entries. Returns broker message ids in entry order.
    fn publish_batch(
        &self,
        queue: &str,
        entries: Vec<OutgoingMessage>,
    ) -> impl Future<Output = Result<Vec<String>, QueueError>> + Send;

    /// Receive up to `max` messages, waiting at most `wait` for one to appear.
    /// An empty vec means nothing arrived in time.
    fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> impl Future<Output = Result<Vec<ReceivedMessage>, QueueError>> + Send;

    /// Acknowledge a delivery so it is never redelivered.
    fn delete(
        &self,
        queue: &str,
        receipt: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(QueueError::Unavailable("down".into()).is_transient());
        assert!(!QueueError::NoSuchQueue("q".into()).is_transient());
        assert!(!QueueError::ReceiptExpired("r".into()).is_transient());
        assert!(!QueueError::BatchTooLarge(11).is_transient());
    }

    #[test]
    fn into_matq_names_queue() {
        let err = QueueError::Unavailable("connection reset".into()).into_matq("queue3");
        assert_eq!(
            err.to_string(),
            "queue queue3 unavailable: broker unavailable: connection reset"
        );
    }
}
