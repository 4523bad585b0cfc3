//! Thumbnail identity cache.
//!
//! Signed photo URLs change on every fetch even when the underlying image
//! does not. To keep the image cache effective, each photo id is pinned to
//! one URI until that URI is older than the TTL and a fresher one is offered.
//! Alongside the URI map live the set of keys known to be warm in the image
//! cache, the set of keys that have painted at least once, and the prefetch
//! queue feeding the warm set.

use crate::api::PhotoId;
use crate::config::ThumbnailConfig;
use crate::prefetch::{warm_item, ImageWarmer, PrefetchItem, PrefetchQueue};
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Image cache key of a photo
pub fn cache_key(photo_id: PhotoId) -> String {
    format!("photo-{photo_id}")
}

#[derive(Debug, Clone)]
struct CacheEntry {
    uri: String,
    /// `None` for entries restored from disk; those count as expired
    observed_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.observed_at
            .map_or(true, |observed| observed.elapsed() > ttl)
    }
}

/// Photo id to stable URI
#[derive(Debug)]
pub struct StableUriMap {
    ttl: Duration,
    entries: Mutex<HashMap<PhotoId, CacheEntry>>,
}

impl StableUriMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// URI to display for `photo_id`.
    ///
    /// Keeps the previous URI unless it has outlived the TTL and `fresh` is
    /// given. A stale URI beats no URI.
    pub fn get_stable_uri(&self, photo_id: Option<PhotoId>, fresh: Option<&str>) -> Option<String> {
        let Some(photo_id) = photo_id else {
            return fresh.map(str::to_string);
        };

        let mut entries = self.entries.lock();
        match entries.get_mut(&photo_id) {
            Some(entry) => {
                if let Some(fresh) = fresh {
                    if entry.is_expired(self.ttl) {
                        entry.uri = fresh.to_string();
                        entry.observed_at = Some(Instant::now());
                    }
                }
                Some(entry.uri.clone())
            }
            None => {
                let fresh = fresh?;
                entries.insert(
                    photo_id,
                    CacheEntry {
                        uri: fresh.to_string(),
                        observed_at: Some(Instant::now()),
                    },
                );
                Some(fresh.to_string())
            }
        }
    }

    /// Record `fresh` as the current URI, regardless of age.
    pub fn bump_uri(&self, photo_id: PhotoId, fresh: &str) {
        self.entries.lock().insert(
            photo_id,
            CacheEntry {
                uri: fresh.to_string(),
                observed_at: Some(Instant::now()),
            },
        );
    }

    /// Restore a URI without an observation time. Live entries win.
    pub fn seed(&self, photo_id: PhotoId, uri: &str) {
        self.entries
            .lock()
            .entry(photo_id)
            .or_insert_with(|| CacheEntry {
                uri: uri.to_string(),
                observed_at: None,
            });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum WarmKeys {
    Bounded(LruCache<String, ()>),
    Unbounded(HashSet<String>),
}

/// Keys whose bytes are known to be in the image cache
pub struct WarmSet {
    keys: Mutex<WarmKeys>,
}

impl WarmSet {
    /// LRU-bounded at `capacity`, or unbounded for `None`
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        let keys = match capacity {
            Some(capacity) => WarmKeys::Bounded(LruCache::new(capacity)),
            None => WarmKeys::Unbounded(HashSet::new()),
        };
        Self {
            keys: Mutex::new(keys),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Membership check; refreshes the key's recency.
    pub fn contains(&self, key: &str) -> bool {
        match &mut *self.keys.lock() {
            WarmKeys::Bounded(lru) => lru.get(key).is_some(),
            WarmKeys::Unbounded(set) => set.contains(key),
        }
    }

    pub fn insert(&self, key: &str) {
        match &mut *self.keys.lock() {
            WarmKeys::Bounded(lru) => {
                lru.put(key.to_string(), ());
            }
            WarmKeys::Unbounded(set) => {
                set.insert(key.to_string());
            }
        }
    }

    pub fn len(&self) -> usize {
        match &*self.keys.lock() {
            WarmKeys::Bounded(lru) => lru.len(),
            WarmKeys::Unbounded(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys that rendered successfully at least once
#[derive(Default)]
pub struct PaintSet {
    keys: Mutex<HashSet<String>>,
}

impl PaintSet {
    pub fn mark(&self, key: &str) {
        self.keys.lock().insert(key.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }
}

/// Process-wide thumbnail state
pub struct ThumbnailCache {
    uris: StableUriMap,
    warm: Arc<WarmSet>,
    painted: PaintSet,
    warmer: Arc<dyn ImageWarmer>,
    prefetch: PrefetchQueue,
}

impl ThumbnailCache {
    pub fn new(config: &ThumbnailConfig, warmer: Arc<dyn ImageWarmer>) -> Self {
        let warm = Arc::new(WarmSet::new(config.warm_capacity()));
        let prefetch = PrefetchQueue::new(
            Arc::clone(&warmer),
            Arc::clone(&warm),
            config.prefetch_concurrency,
            config.prefetch_batch_size,
        );
        Self {
            uris: StableUriMap::new(config.stable_uri_ttl()),
            warm,
            painted: PaintSet::default(),
            warmer,
            prefetch,
        }
    }

    pub fn get_stable_uri(&self, photo_id: Option<PhotoId>, fresh: Option<&str>) -> Option<String> {
        self.uris.get_stable_uri(photo_id, fresh)
    }

    pub fn bump_uri(&self, photo_id: PhotoId, fresh: &str) {
        self.uris.bump_uri(photo_id, fresh)
    }

    pub fn seed_uri(&self, photo_id: PhotoId, uri: &str) {
        self.uris.seed(photo_id, uri)
    }

    pub fn uris(&self) -> &StableUriMap {
        &self.uris
    }

    pub fn warm_set(&self) -> &WarmSet {
        &self.warm
    }

    pub fn is_painted(&self, key: &str) -> bool {
        self.painted.contains(key)
    }

    pub fn prefetch_queue(&self) -> &PrefetchQueue {
        &self.prefetch
    }

    /// Queue items for background warming.
    pub fn enqueue_prefetch(&self, items: impl IntoIterator<Item = PrefetchItem>) {
        self.prefetch.enqueue(items)
    }

    /// Warm items concurrently and wait for all of them. Keys already warm
    /// are skipped. Returns how many items went through a prefetch.
    pub async fn warm_now(&self, items: &[PrefetchItem]) -> usize {
        let pending: Vec<&PrefetchItem> = items
            .iter()
            .filter(|item| !self.warm.contains(&item.key))
            .collect();
        let count = pending.len();

        join_all(
            pending
                .into_iter()
                .map(|item| warm_item(self.warmer.as_ref(), &self.warm, item)),
        )
        .await;

        debug!(requested = items.len(), warmed = count, "Warm pass finished");
        count
    }

    /// Start tracking a rendered thumbnail. `None` means a placeholder is
    /// shown: there is no photo id or no URI.
    pub fn view(self: &Arc<Self>, photo_id: Option<PhotoId>, fresh: Option<&str>) -> Option<ThumbnailView> {
        let (photo_id, fresh) = (photo_id?, fresh?);
        let canonical = self.get_stable_uri(Some(photo_id), Some(fresh))?;
        Some(ThumbnailView {
            cache: Arc::clone(self),
            photo_id,
            key: cache_key(photo_id),
            fresh: fresh.to_string(),
            canonical: canonical.clone(),
            displayed: canonical,
            retried: false,
        })
    }
}

/// What a [`ThumbnailView::sync`] did to the displayed URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderDecision {
    /// Already showing the canonical URI
    Unchanged,
    /// Switched to the canonical URI
    Swapped(String),
    /// Canonical URI could not be warmed; the previous image stays
    Kept,
}

/// Display state of one thumbnail.
///
/// Never swaps to a URI whose bytes are not warm, so a rendered thumbnail
/// does not flash back to a loading state.
pub struct ThumbnailView {
    cache: Arc<ThumbnailCache>,
    photo_id: PhotoId,
    key: String,
    fresh: String,
    canonical: String,
    displayed: String,
    retried: bool,
}

impl ThumbnailView {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn displayed(&self) -> &str {
        &self.displayed
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Whether a loading state may be shown; painted keys skip it
    pub fn should_show_loading(&self) -> bool {
        !self.cache.is_painted(&self.key)
    }

    /// Re-resolve the canonical URI against a newly fetched one and swap the
    /// displayed image when allowed.
    pub async fn sync(&mut self, fresh: &str) -> RenderDecision {
        self.fresh = fresh.to_string();
        if let Some(canonical) = self.cache.get_stable_uri(Some(self.photo_id), Some(fresh)) {
            self.canonical = canonical;
        }

        if self.canonical == self.displayed {
            return RenderDecision::Unchanged;
        }

        if self.cache.warm.contains(&self.key) {
            self.displayed = self.canonical.clone();
            return RenderDecision::Swapped(self.displayed.clone());
        }

        match self.cache.warmer.prefetch(&self.canonical).await {
            Ok(()) => {
                self.cache.warm.insert(&self.key);
                self.displayed = self.canonical.clone();
                RenderDecision::Swapped(self.displayed.clone())
            }
            Err(e) => {
                debug!(key = %self.key, error = %e, "Keeping previous image");
                RenderDecision::Kept
            }
        }
    }

    /// The displayed image failed to load. Returns the URI to retry with,
    /// at most once and only when a different fresh URI is known.
    pub fn on_error(&mut self) -> Option<String> {
        if self.retried || self.displayed == self.fresh {
            return None;
        }
        self.retried = true;
        self.cache.bump_uri(self.photo_id, &self.fresh);
        self.canonical = self.fresh.clone();
        self.displayed = self.fresh.clone();
        Some(self.displayed.clone())
    }

    /// The displayed image finished loading.
    pub fn on_load_end(&mut self) {
        self.cache.painted.mark(&self.key);
        self.cache.bump_uri(self.photo_id, &self.fresh);
    }
}
