//! Per-client outbound queue
//!
//! Each playing client owns one bounded queue. When it is full the oldest
//! unit is evicted, so a slow client only ever loses its own data.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::mux::StreamUnit;

/// A unit tagged with its per-client position
#[derive(Debug, Clone)]
pub struct QueuedUnit {
    pub seq: u64,
    pub unit: Arc<StreamUnit>,
}

pub struct ClientQueue {
    queue: ArrayQueue<QueuedUnit>,
    notify: Notify,
    next_seq: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl ClientQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue, evicting the oldest unit when full. Returns false if one was evicted.
    pub fn push(&self, unit: Arc<StreamUnit>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let evicted = self.queue.force_push(QueuedUnit { seq, unit }).is_some();
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        !evicted
    }

    pub fn pop(&self) -> Option<QueuedUnit> {
        self.queue.pop()
    }

    /// Wait until something was pushed since the last wakeup
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Stop accepting units and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
