//! Bounded, keyed FIFO shared by a dispatcher and a worker pool.
//!
//! Items with the same [`ObjectKey`] are handed out one at a time and in
//! arrival order: while a key is leased (or waiting out a retry backoff) no
//! other item for it is popped. Items for different keys are independent.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::cache::ObjectKey;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is shut down")]
    ShutDown,
}

struct Entry<T> {
    key: ObjectKey,
    item: T,
    retries: u32,
}

struct State<T> {
    pending: VecDeque<Entry<T>>,
    active: HashSet<ObjectKey>,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    closed: CancellationToken,
}

/// Exclusive claim on one queued item. Hand it back with
/// [`WorkQueue::done`] or [`WorkQueue::requeue_after`].
#[derive(Debug)]
pub struct Lease<T> {
    key: ObjectKey,
    item: T,
    retries: u32,
}

impl<T> Lease<T> {
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn item(&self) -> &T {
        &self.item
    }

    /// How many times this item has already been requeued.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    active: HashSet::new(),
                    closed: false,
                }),
                capacity: capacity.max(1),
                readable: Notify::new(),
                writable: Notify::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Enqueue an item, waiting while the queue is at capacity.
    pub async fn push(&self, key: ObjectKey, item: T) -> Result<(), QueueError> {
        loop {
            let writable = self.inner.writable.notified();
            {
                let mut s = self.inner.state.lock().await;
                if s.closed {
                    return Err(QueueError::ShutDown);
                }
                if s.pending.len() < self.inner.capacity {
                    s.pending.push_back(Entry {
                        key,
                        item,
                        retries: 0,
                    });
                    drop(s);
                    self.inner.readable.notify_waiters();
                    return Ok(());
                }
            }
            writable.await;
        }
    }

    /// Lease the oldest item whose key is not already leased. Returns `None`
    /// once the queue is shut down.
    pub async fn pop(&self) -> Option<Lease<T>> {
        loop {
            let readable = self.inner.readable.notified();
            {
                let mut s = self.inner.state.lock().await;
                if s.closed {
                    return None;
                }
                let State {
                    pending, active, ..
                } = &mut *s;
                let ready = pending.iter().position(|e| !active.contains(&e.key));
                if let Some(entry) = ready.and_then(|pos| pending.remove(pos)) {
                    active.insert(entry.key.clone());
                    drop(s);
                    self.inner.writable.notify_waiters();
                    return Some(Lease {
                        key: entry.key,
                        item: entry.item,
                        retries: entry.retries,
                    });
                }
            }
            readable.await;
        }
    }

    /// Release the lease's key so the next item for it can be popped.
    pub async fn done(&self, lease: Lease<T>) {
        self.inner.state.lock().await.active.remove(&lease.key);
        self.inner.readable.notify_waiters();
    }

    /// Put the item back at the head of the queue after `delay`. The key stays
    /// leased during the delay so later items for it keep waiting behind the
    /// retry. Retries ignore the capacity bound.
    pub fn requeue_after(&self, lease: Lease<T>, delay: Duration) {
        let inner = self.inner.clone();
        let Lease { key, item, retries } = lease;
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.closed.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut s = inner.state.lock().await;
            s.active.remove(&key);
            if s.closed {
                return;
            }
            trace!(%key, retries = retries + 1, "queue: retry ready");
            s.pending.push_front(Entry {
                key,
                item,
                retries: retries + 1,
            });
            drop(s);
            inner.readable.notify_waiters();
        });
    }

    /// Stop handing out work. Pending items and backoff timers are dropped;
    /// leases already held stay valid until returned.
    pub async fn shutdown(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.closed.cancel();
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Nothing pending, leased, or waiting out a backoff.
    pub async fn is_idle(&self) -> bool {
        let s = self.inner.state.lock().await;
        s.pending.is_empty() && s.active.is_empty()
    }
}
