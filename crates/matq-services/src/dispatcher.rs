//! Publishes a run's task messages to the slot input queues.
//!
//! Task `i` goes to input queue `i mod N`, in batches of at most
//! `MAX_BATCH` entries whose entry id is the task index. Batches are sent
//! round-robin across slots so every worker gets work early. The cancel
//! flag is checked before each batch; once raised nothing more is sent.
//! Every task carries the run id so late completions can be told apart.

use bytes::Bytes;

use matq_core::wire::{encode_task, Operation};
use matq_core::{MatqError, Partition};

use crate::cancel::CancelFlag;
use crate::queue::{OutgoingMessage, QueueClient, MAX_BATCH};
use crate::retry::{self, RetryPolicy};
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    pub total: usize,
    pub cancelled: bool,
}

pub struct Dispatcher<Q> {
    client: Q,
    topology: Topology,
    retry: RetryPolicy,
}

impl<Q: QueueClient> Dispatcher<Q> {
    pub fn new(client: Q, topology: Topology, retry: RetryPolicy) -> Self {
        Self {
            client,
            topology,
            retry,
        }
    }

    /// Encode every partition and group the messages into per-slot batches.
    fn batches(
        &self,
        run_id: &str,
        operation: Operation,
        partitions: &[Partition],
    ) -> Result<Vec<Vec<Vec<OutgoingMessage>>>, MatqError> {
        let mut per_slot: Vec<Vec<OutgoingMessage>> = vec![Vec::new(); self.topology.slots()];
        for p in partitions {
            let body = encode_task(run_id, operation, p.index, &p.a, &p.b)
                .map_err(|e| MatqError::MalformedTask(e.to_string()))?;
            per_slot[self.topology.slot_for(p.index)].push(OutgoingMessage {
                id: p.index.to_string(),
                body: Bytes::from(body),
            });
        }
        Ok(per_slot
            .into_iter()
            .map(|msgs| msgs.chunks(MAX_BATCH).map(<[_]>::to_vec).collect())
            .collect())
    }

    pub async fn dispatch(
        &self,
        run_id: &str,
        operation: Operation,
        partitions: &[Partition],
        cancel: &CancelFlag,
    ) -> Result<DispatchReport, MatqError> {
        let total = partitions.len();
        let per_slot = self.batches(run_id, operation, partitions)?;
        let rounds = per_slot.iter().map(Vec::len).max().unwrap_or(0);
        let mut published = 0;

        for round in 0..rounds {
            for (slot, batches) in per_slot.iter().enumerate() {
                let Some(batch) = batches.get(round) else {
                    continue;
                };
                if cancel.is_cancelled() {
                    tracing::info!(published, total, "dispatch cancelled");
                    return Ok(DispatchReport {
                        published,
                        total,
                        cancelled: true,
                    });
                }
                let queue = self.topology.input_queue(slot);
                retry::with_backoff(&self.retry, "publish tasks", || {
                    self.client.publish_batch(&queue, batch.clone())
                })
                .await
                .map_err(|e| e.into_matq(&queue))?;
                published += batch.len();
                tracing::debug!(%queue, count = batch.len(), "task batch published");
            }
        }

        tracing::info!(%operation, published, slots = self.topology.slots(), "dispatch complete");
        Ok(DispatchReport {
            published,
            total,
            cancelled: false,
        })
    }
}
