//! Delayed work queue feeding the delivery workers.
//!
//! Messages only carry the webhook event id; the event row is the source of
//! truth, so a queue that loses messages on restart is safe as long as
//! pending events are re-enqueued at startup (see
//! [`crate::webhook::DeliveryWorker::recover`]).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;

/// One pending delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryJob {
    pub event_id: Uuid,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue `job`, visible to consumers after `delay`.
    async fn push(&self, job: DeliveryJob, delay: Duration) -> Result<()>;

    /// Wait for the next due job. `None` once the queue is closed.
    async fn pop(&self) -> Option<DeliveryJob>;

    /// Jobs currently queued, due or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out jobs and wake every waiting consumer.
    fn close(&self);
}

type Entry = Reverse<(Instant, u64, DeliveryJob)>;

/// In-process [`TaskQueue`] ordered by due time.
#[derive(Default)]
pub struct MemoryQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn heap(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Entry>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Next {
    Ready(DeliveryJob),
    At(Instant),
    Empty,
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, job: DeliveryJob, delay: Duration) -> Result<()> {
        let due = Instant::now() + delay;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap().push(Reverse((due, seq, job)));
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self) -> Option<DeliveryJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the heap so a concurrent push is not missed.
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            let next = {
                let mut heap = self.heap();
                match heap.peek() {
                    Some(Reverse((due, _, _))) if *due <= Instant::now() => {
                        heap.pop().map(|Reverse((_, _, job))| Next::Ready(job))
                    }
                    Some(Reverse((due, _, _))) => Some(Next::At(*due)),
                    None => Some(Next::Empty),
                }
            };

            match next {
                Some(Next::Ready(job)) => return Some(job),
                Some(Next::At(due)) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = &mut notified => {}
                    }
                }
                Some(Next::Empty) | None => notified.await,
            }
        }
    }

    fn len(&self) -> usize {
        self.heap().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
