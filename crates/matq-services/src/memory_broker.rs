//! In-memory at-least-once broker.
//!
//! Behaves like a managed queue service as far as the protocol can tell:
//! a received message is hidden for the visibility timeout and comes back
//! with a fresh receipt if it is not deleted in time. After
//! `max_receive_count` expired deliveries it moves to the queue's
//! dead-letter list instead. Nothing is ordered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use matq_core::config::QueueConfig;

use crate::queue::{OutgoingMessage, QueueClient, QueueError, ReceivedMessage, MAX_BATCH};

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub visibility_timeout: Duration,
    /// 0 = never dead-letter.
    pub max_receive_count: u32,
    pub retention: Option<Duration>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for BrokerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout(),
            max_receive_count: config.max_receive_count,
            retention: config.retention(),
        }
    }
}

/// Message counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
    pub dead: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Bytes,
    sent_at: Instant,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    /// receipt → delivery
    in_flight: HashMap<String, InFlight>,
    dead: Vec<StoredMessage>,
    seq: u64,
}

impl QueueState {
    /// Return expired deliveries to the ready list (or dead-letter them) and
    /// drop messages past retention. Returns when the next in-flight message
    /// becomes visible again.
    fn reclaim(&mut self, name: &str, now: Instant, settings: &BrokerSettings) -> Option<Instant> {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            let Some(flight) = self.in_flight.remove(&receipt) else {
                continue;
            };
            let msg = flight.message;
            if settings.max_receive_count > 0 && msg.receive_count >= settings.max_receive_count {
                tracing::warn!(
                    queue = name,
                    message_id = &msg.message_id[..12],
                    receive_count = msg.receive_count,
                    "message dead-lettered"
                );
                self.dead.push(msg);
            } else {
                self.ready.push_back(msg);
            }
        }

        if let Some(retention) = settings.retention {
            let before = self.ready.len();
            self.ready
                .retain(|m| now.saturating_duration_since(m.sent_at) < retention);
            let dropped = before - self.ready.len();
            if dropped > 0 {
                tracing::debug!(queue = name, dropped, "messages expired past retention");
            }
        }

        self.in_flight.values().map(|f| f.visible_at).min()
    }

    fn take(&mut self, max: usize, now: Instant, settings: &BrokerSettings) -> Vec<ReceivedMessage> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut msg) = self.ready.pop_front() else {
                break;
            };
            msg.receive_count += 1;
            let receipt = receipt_for(&msg);
            out.push(ReceivedMessage {
                message_id: msg.message_id.clone(),
                receipt: receipt.clone(),
                body: msg.body.clone(),
                receive_count: msg.receive_count,
            });
            self.in_flight.insert(
                receipt,
                InFlight {
                    message: msg,
                    visible_at: now + settings.visibility_timeout,
                },
            );
        }
        out
    }
}

struct QueueSlot {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl QueueSlot {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pending injected failures, consumed one per call.
#[derive(Default)]
struct Faults {
    publish: AtomicU32,
    receive: AtomicU32,
}

fn trip(counter: &AtomicU32, what: &str) -> Result<(), QueueError> {
    let tripped = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if tripped {
        Err(QueueError::Unavailable(format!("injected {what} failure")))
    } else {
        Ok(())
    }
}

static RECEIPT_NONCE: AtomicU64 = AtomicU64::new(0);

fn receipt_for(msg: &StoredMessage) -> String {
    let nonce = RECEIPT_NONCE.fetch_add(1, Ordering::Relaxed);
    let mut h = blake3::Hasher::new();
    h.update(msg.message_id.as_bytes());
    h.update(&msg.receive_count.to_le_bytes());
    h.update(&nonce.to_le_bytes());
    hex::encode(&h.finalize().as_bytes()[..16])
}

/// Cheaply cloneable handle; clones share all queues.
#[derive(Clone)]
pub struct MemoryBroker {
    queues: Arc<DashMap<String, Arc<QueueSlot>>>,
    settings: Arc<BrokerSettings>,
    faults: Arc<Faults>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl MemoryBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            settings: Arc::new(settings),
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    fn slot(&self, name: &str) -> Result<Arc<QueueSlot>, QueueError> {
        self.queues
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| QueueError::NoSuchQueue(name.to_string()))
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.faults.publish.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` receives with a transient error.
    pub fn fail_next_receives(&self, n: u32) {
        self.faults.receive.store(n, Ordering::SeqCst);
    }

    /// Sorted queue names.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn depth(&self, name: &str) -> Option<QueueDepth> {
        let slot = self.slot(name).ok()?;
        let mut state = slot.lock();
        state.reclaim(name, Instant::now(), &self.settings);
        Some(QueueDepth {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            dead: state.dead.len(),
        })
    }

    /// Bodies of dead-lettered messages, oldest first.
    pub fn dead_letters(&self, name: &str) -> Vec<Bytes> {
        match self.slot(name) {
            Ok(slot) => {
                let mut state = slot.lock();
                state.reclaim(name, Instant::now(), &self.settings);
                state.dead.iter().map(|m| m.body.clone()).collect()
            }
            Err(_) => Vec::new(),
        }
    }
}

impl QueueClient for MemoryBroker {
    async fn create_queue(&self, name: &str) -> Result<(), QueueError> {
        self.queues.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(queue = name, "queue created");
            Arc::new(QueueSlot {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            })
        });
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), QueueError> {
        let (_, slot) = self
            .queues
            .remove(name)
            .ok_or_else(|| QueueError::NoSuchQueue(name.to_string()))?;
        slot.notify.notify_waiters();
        tracing::debug!(queue = name, "queue deleted");
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<(), QueueError> {
        let slot = self.slot(name)?;
        let mut state = slot.lock();
        let purged = state.ready.len() + state.in_flight.len() + state.dead.len();
        state.ready.clear();
        state.in_flight.clear();
        state.dead.clear();
        if purged > 0 {
            tracing::info!(queue = name, purged, "queue purged");
        }
        Ok(())
    }

    async fn publish_batch(
        &self,
        queue: &str,
        entries: Vec<OutgoingMessage>,
    ) -> Result<Vec<String>, QueueError> {
        if entries.is_empty() {
            return Err(QueueError::EmptyBatch);
        }
        if entries.len() > MAX_BATCH {
            return Err(QueueError::BatchTooLarge(entries.len()));
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.id == entry.id) {
                return Err(QueueError::DuplicateEntryId(entry.id.clone()));
            }
        }
        trip(&self.faults.publish, "publish")?;
        let slot = self.slot(queue)?;

        let ids = {
            let mut state = slot.lock();
            let now = Instant::now();
            let mut ids = Vec::with_capacity(entries.len());
            for entry in entries {
                state.seq += 1;
                let mut h = blake3::Hasher::new();
                h.update(queue.as_bytes());
                h.update(&state.seq.to_le_bytes());
                h.update(&entry.body);
                let message_id = hex::encode(&h.finalize().as_bytes()[..16]);
                state.ready.push_back(StoredMessage {
                    message_id: message_id.clone(),
                    body: entry.body,
                    sent_at: now,
                    receive_count: 0,
                });
                ids.push(message_id);
            }
            ids
        };
        slot.notify.notify_waiters();
        Ok(ids)
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        trip(&self.faults.receive, "receive")?;
        let slot = self.slot(queue)?;
        let max = max.clamp(1, MAX_BATCH);
        let deadline = Instant::now() + wait;

        loop {
            let notified = slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = {
                let mut state = slot.lock();
                let now = Instant::now();
                let next = state.reclaim(queue, now, &self.settings);
                let batch = state.take(max, now, &self.settings);
                if !batch.is_empty() {
                    return Ok(batch);
                }
                next
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
            if !self.queues.contains_key(queue) {
                return Err(QueueError::NoSuchQueue(queue.to_string()));
            }
        }
    }

    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), QueueError> {
        let slot = self.slot(queue)?;
        let mut state = slot.lock();
        match state.in_flight.remove(receipt) {
            Some(_) => Ok(()),
            None => Err(QueueError::ReceiptExpired(receipt.to_string())),
        }
    }
}
