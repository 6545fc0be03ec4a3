//! Worker pool that drains a [`WorkQueue`] through a [`Reconciler`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::SyncSignal;
use crate::config::RetryConfig;
use crate::dispatch::WorkItem;
use crate::queue::{Lease, WorkQueue};
use crate::reconciler::Reconciler;

/// Exponential backoff with a ceiling on the number of retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retries + 1`: `base * 2^retries`, capped.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: cfg.base_delay(),
            max_delay: cfg.max_delay(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ControllerStats {
    reconciled: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl ControllerStats {
    pub fn reconciled(&self) -> u64 {
        self.reconciled.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Items given up on, either permanently failed or out of retries.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct Controller<R: Reconciler> {
    name: String,
    reconciler: Arc<R>,
    queue: WorkQueue<WorkItem<R::Resource>>,
    retry: RetryPolicy,
    synced: Vec<SyncSignal>,
    stats: Arc<ControllerStats>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        name: &str,
        reconciler: Arc<R>,
        queue: WorkQueue<WorkItem<R::Resource>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            reconciler,
            queue,
            retry,
            synced: Vec::new(),
            stats: Arc::new(ControllerStats::default()),
        }
    }

    /// Hold off all work until the cache behind `signal` has synced.
    pub fn wait_for(mut self, signal: SyncSignal) -> Self {
        self.synced.push(signal);
        self
    }

    pub fn stats(&self) -> Arc<ControllerStats> {
        self.stats.clone()
    }

    /// Run `workers` workers until `shutdown` fires. Pending items are then
    /// discarded; items already being reconciled run to completion first.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) {
        let name = self.name.clone();
        for signal in self.synced.iter().cloned() {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.queue.shutdown().await;
                    debug!(controller = %name, "shut down before caches synced");
                    return;
                }
                synced = signal.wait() => {
                    if !synced {
                        error!(controller = %name, "cache closed before initial sync; not starting");
                        self.queue.shutdown().await;
                        return;
                    }
                }
            }
        }

        info!(controller = %name, workers, "caches synced; starting workers");
        let mut pool = JoinSet::new();
        for id in 0..workers.max(1) {
            let worker = Worker {
                id,
                controller: name.clone(),
                reconciler: self.reconciler.clone(),
                queue: self.queue.clone(),
                retry: self.retry.clone(),
                stats: self.stats.clone(),
            };
            pool.spawn(worker.run());
        }

        shutdown.cancelled().await;
        self.queue.shutdown().await;
        while let Some(res) = pool.join_next().await {
            if let Err(e) = res {
                error!(controller = %name, error = %e, "worker panicked");
            }
        }
        info!(controller = %name, "stopped");
    }
}

struct Worker<R: Reconciler> {
    id: usize,
    controller: String,
    reconciler: Arc<R>,
    queue: WorkQueue<WorkItem<R::Resource>>,
    retry: RetryPolicy,
    stats: Arc<ControllerStats>,
}

impl<R: Reconciler> Worker<R> {
    async fn run(self) {
        while let Some(lease) = self.queue.pop().await {
            self.process(lease).await;
        }
        debug!(controller = %self.controller, worker = self.id, "worker exiting");
    }

    async fn process(&self, lease: Lease<WorkItem<R::Resource>>) {
        let item = lease.item();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(item))
            .catch_unwind()
            .await;
        let err = match outcome {
            Ok(Ok(())) => {
                self.stats.reconciled.fetch_add(1, Ordering::Relaxed);
                debug!(controller = %self.controller, key = %item.key, action = %item.action, "reconciled");
                self.queue.done(lease).await;
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => {
                // The key must be released or later items for it never run.
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    controller = %self.controller,
                    key = %item.key,
                    action = %item.action,
                    "reconciler panicked; dropping work item"
                );
                self.queue.done(lease).await;
                return;
            }
        };

        let attempts = lease.retries() + 1;
        if err.is_retryable() && lease.retries() < self.retry.max_retries {
            let delay = self.retry.delay(lease.retries());
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                controller = %self.controller,
                key = %item.key,
                action = %item.action,
                attempts,
                ?delay,
                error = %err,
                "reconcile failed; requeueing"
            );
            self.queue.requeue_after(lease, delay);
        } else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                controller = %self.controller,
                key = %item.key,
                action = %item.action,
                attempts,
                retryable = err.is_retryable(),
                error = %err,
                "dropping work item"
            );
            self.queue.done(lease).await;
        }
    }
}
