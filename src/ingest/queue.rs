//! Work queue abstraction and a bounded in-process implementation.
//!
//! A chunk is enqueued once when its job is planned. The consumer acks it
//! when the chunk settles, or nacks it with a delay to run it again later.
//! Capacity counts every item not yet acked (ready, delayed and in flight),
//! so a full queue pushes back on planning instead of growing without bound.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::AppError;

/// One schedulable chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub job_id: String,
    pub chunk_number: i64,
    /// Higher runs first.
    pub priority: i32,
    /// Times this item was handed back with `nack_with_delay`.
    pub attempt: u32,
}

pub type DeliveryTag = u64;

#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub item: WorkItem,
}

type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'a>>;

/// Queue seam used by the engine; implementable over a channel, Redis, or
/// any durable broker with ack/nack semantics.
pub trait WorkQueue: Send + Sync {
    /// Adds an item, waiting while the queue is full.
    fn enqueue(&self, item: WorkItem) -> QueueFuture<'_, ()>;

    /// Adds an item or fails with `QueueFull` right away.
    fn try_enqueue(&self, item: WorkItem) -> Result<(), AppError>;

    /// Waits for the next ready item.
    fn dequeue(&self) -> QueueFuture<'_, Delivery>;

    /// Marks a delivery done and frees its capacity.
    fn ack(&self, tag: DeliveryTag) -> Result<(), AppError>;

    /// Returns a delivery to the queue, ready again after `delay`.
    fn nack_with_delay(&self, tag: DeliveryTag, delay: Duration) -> Result<(), AppError>;

    /// Stops deliveries; pending and future `dequeue` calls fail with `QueueClosed`.
    fn close(&self);

    /// Items not yet acked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ChannelQueue
// ─────────────────────────────────────────────────────────────────────────────

struct Entry {
    item: WorkItem,
    seq: u64,
    _slot: OwnedSemaphorePermit,
}

impl Entry {
    /// Priority desc, then chunk number asc, then arrival order.
    fn key(&self) -> (i32, std::cmp::Reverse<i64>, std::cmp::Reverse<u64>) {
        (
            self.item.priority,
            std::cmp::Reverse(self.item.chunk_number),
            std::cmp::Reverse(self.seq),
        )
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct Delayed {
    ready_at: Instant,
    entry: Entry,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Earliest first in a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at)
    }
}

#[derive(Default)]
struct Inner {
    ready: BinaryHeap<Entry>,
    delayed: BinaryHeap<Delayed>,
    in_flight: HashMap<DeliveryTag, Entry>,
    next_tag: DeliveryTag,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(d) = self.delayed.pop() {
                self.ready.push(d.entry);
            }
        }
    }
}

/// Bounded in-process queue with priorities and delayed redelivery.
pub struct ChannelQueue {
    inner: Mutex<Inner>,
    slots: Arc<Semaphore>,
    capacity: usize,
    notify: Notify,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deliveries handed out and not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, item: WorkItem, slot: OwnedSemaphorePermit) -> Result<(), AppError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(AppError::QueueClosed);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.ready.push(Entry {
                item,
                seq,
                _slot: slot,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

impl WorkQueue for ChannelQueue {
    fn enqueue(&self, item: WorkItem) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            let slot = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AppError::QueueClosed)?;
            self.push(item, slot)
        })
    }

    fn try_enqueue(&self, item: WorkItem) -> Result<(), AppError> {
        let slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                tokio::sync::TryAcquireError::Closed => AppError::QueueClosed,
                tokio::sync::TryAcquireError::NoPermits => AppError::QueueFull,
            })?;
        self.push(item, slot)
    }

    fn dequeue(&self) -> QueueFuture<'_, Delivery> {
        Box::pin(async move {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let next_due = {
                    let mut inner = self.lock();
                    if inner.closed {
                        return Err(AppError::QueueClosed);
                    }
                    inner.promote_due(Instant::now());

                    if let Some(entry) = inner.ready.pop() {
                        let tag = inner.next_tag;
                        inner.next_tag += 1;
                        let item = entry.item.clone();
                        inner.in_flight.insert(tag, entry);
                        return Ok(Delivery { tag, item });
                    }
                    inner.delayed.peek().map(|d| d.ready_at)
                };

                match next_due {
                    Some(at) => {
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = tokio::time::sleep_until(at) => {}
                        }
                    }
                    None => notified.await,
                }
            }
        })
    }

    fn ack(&self, tag: DeliveryTag) -> Result<(), AppError> {
        self.lock()
            .in_flight
            .remove(&tag)
            .map(drop)
            .ok_or_else(|| AppError::NotFound(format!("delivery {tag}")))
    }

    fn nack_with_delay(&self, tag: DeliveryTag, delay: Duration) -> Result<(), AppError> {
        {
            let mut inner = self.lock();
            let mut entry = inner
                .in_flight
                .remove(&tag)
                .ok_or_else(|| AppError::NotFound(format!("delivery {tag}")))?;
            entry.item.attempt += 1;
            inner.delayed.push(Delayed {
                ready_at: Instant::now() + delay,
                entry,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.slots.close();
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        let inner = self.lock();
        inner.ready.len() + inner.delayed.len() + inner.in_flight.len()
    }
}
