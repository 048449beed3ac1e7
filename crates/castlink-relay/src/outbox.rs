//! Bounded per-client outbound queue.
//!
//! One writer (the dispatch task) pushes without ever waiting; one reader (the
//! client's socket writer task) pops. When the queue is full the configured
//! [`OverflowPolicy`] decides which frame is discarded.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::config::OverflowPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame.
    DroppedOldest,
    /// Not queued; the queue was full.
    DroppedNewest,
    /// The reader is gone.
    Closed,
}

impl PushOutcome {
    pub fn dropped(self) -> bool {
        matches!(self, PushOutcome::DroppedOldest | PushOutcome::DroppedNewest)
    }
}

#[derive(Debug)]
struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

#[derive(Debug)]
pub struct Outbox<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> Outbox<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without blocking.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            if inner.queue.len() < self.capacity {
                inner.queue.push_back(item);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropNewest => return PushOutcome::DroppedNewest,
                    OverflowPolicy::DropOldest => {
                        inner.queue.pop_front();
                        inner.queue.push_back(item);
                        PushOutcome::DroppedOldest
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next frame. Returns `None` once the outbox is closed;
    /// frames still queued at that point are discarded.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    return Some(item);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.queue.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
