//! Background thumbnail prefetching.
//!
//! Items are warmed by a bounded pool of workers. Each worker takes a batch
//! from the front of the queue, warms it item by item, and pulls the next
//! batch as soon as it is done.

use crate::thumbnails::WarmSet;
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, trace};

/// Errors raised while warming an image
#[derive(Error, Debug)]
pub enum WarmError {
    #[error("Prefetch request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Prefetch returned status {0}")]
    Status(u16),
}

/// Brings image bytes into the local image cache
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageWarmer: Send + Sync {
    /// Full-fidelity prefetch
    async fn prefetch(&self, uri: &str) -> Result<(), WarmError>;

    /// Cheaper prefetch used when the full one fails
    async fn prefetch_fallback(&self, uri: &str) -> Result<(), WarmError>;
}

/// Warmer keeping downloaded bytes in a bounded in-memory LRU
pub struct HttpImageWarmer {
    http: reqwest::Client,
    bytes: Mutex<LruCache<String, Bytes>>,
}

impl HttpImageWarmer {
    pub fn new(http: reqwest::Client, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            http,
            bytes: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached bytes for `uri`, if any
    pub fn cached(&self, uri: &str) -> Option<Bytes> {
        self.bytes.lock().get(uri).cloned()
    }
}

#[async_trait]
impl ImageWarmer for HttpImageWarmer {
    async fn prefetch(&self, uri: &str) -> Result<(), WarmError> {
        if self.bytes.lock().contains(uri) {
            return Ok(());
        }

        let response = self.http.get(uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WarmError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;

        trace!(bytes = body.len(), "Image bytes cached");
        self.bytes.lock().put(uri.to_string(), body);
        Ok(())
    }

    async fn prefetch_fallback(&self, uri: &str) -> Result<(), WarmError> {
        let response = self.http.head(uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WarmError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// One queued prefetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchItem {
    pub uri: String,
    /// Warm set key (`photo-{id}`)
    pub key: String,
}

/// Warm one item: primary prefetch, then the fallback on failure. The key is
/// marked warm either way. Returns whether the primary prefetch succeeded.
pub(crate) async fn warm_item(
    warmer: &dyn ImageWarmer,
    warm: &WarmSet,
    item: &PrefetchItem,
) -> bool {
    let primary = match warmer.prefetch(&item.uri).await {
        Ok(()) => {
            metrics::counter!("thumbnails.prefetch.warmed").increment(1);
            true
        }
        Err(e) => {
            debug!(key = %item.key, error = %e, "Prefetch failed, trying fallback");
            metrics::counter!("thumbnails.prefetch.fallback").increment(1);
            if let Err(e) = warmer.prefetch_fallback(&item.uri).await {
                debug!(key = %item.key, error = %e, "Fallback prefetch failed");
            }
            false
        }
    };
    warm.insert(&item.key);
    primary
}

struct QueueInner {
    warmer: Arc<dyn ImageWarmer>,
    warm: Arc<WarmSet>,
    queue: Mutex<VecDeque<PrefetchItem>>,
    workers: Arc<Semaphore>,
    batch_size: usize,
    running: AtomicUsize,
    idle: Notify,
}

/// FIFO prefetch queue served by a bounded worker pool
#[derive(Clone)]
pub struct PrefetchQueue {
    inner: Arc<QueueInner>,
}

impl PrefetchQueue {
    pub fn new(
        warmer: Arc<dyn ImageWarmer>,
        warm: Arc<WarmSet>,
        workers: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                warmer,
                warm,
                queue: Mutex::new(VecDeque::new()),
                workers: Arc::new(Semaphore::new(workers.max(1))),
                batch_size: batch_size.max(1),
                running: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Append items and start workers for them. Must be called from within
    /// a tokio runtime.
    pub fn enqueue(&self, items: impl IntoIterator<Item = PrefetchItem>) {
        let added = {
            let mut queue = self.inner.queue.lock();
            let before = queue.len();
            queue.extend(items);
            queue.len() - before
        };
        if added > 0 {
            debug!(added, "Prefetch items queued");
        }
        pump(&self.inner);
    }

    /// Items not yet taken by a worker
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Workers currently warming a batch
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    /// Wait until the queue is empty and every worker has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl QueueInner {
    /// `running` only changes while the queue lock is held, so both are read
    /// under it.
    fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        queue.is_empty() && self.running.load(Ordering::SeqCst) == 0
    }
}

fn pump(inner: &Arc<QueueInner>) {
    loop {
        let Ok(permit) = inner.workers.clone().try_acquire_owned() else {
            return;
        };

        let batch: Vec<PrefetchItem> = {
            let mut queue = inner.queue.lock();
            let take = inner.batch_size.min(queue.len());
            if take == 0 {
                return;
            }
            inner.running.fetch_add(1, Ordering::SeqCst);
            queue.drain(..take).collect()
        };

        let worker = Arc::clone(inner);
        tokio::spawn(async move {
            for item in &batch {
                warm_item(worker.warmer.as_ref(), &worker.warm, item).await;
            }
            drop(permit);
            {
                let _queue = worker.queue.lock();
                worker.running.fetch_sub(1, Ordering::SeqCst);
            }

            pump(&worker);
            if worker.is_idle() {
                worker.idle.notify_waiters();
            }
        });
    }
}
