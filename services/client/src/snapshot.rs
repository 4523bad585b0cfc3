//! Persisted history list and boot-time thumbnail warming.
//!
//! The most recent rows of the history list are kept on disk so the first
//! screen can render before the network answers. At boot the snapshot (if
//! any) is shown after warming its first thumbnails, while a network refresh
//! replaces it in the background.

use crate::api::{ApiClient, ApiError, PhotoId, ResourceId, ResourceRecord};
use crate::config::SnapshotConfig;
use crate::kv::{KvError, KvStore};
use crate::prefetch::PrefetchItem;
use crate::thumbnails::{cache_key, ThumbnailCache};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Storage key of the snapshot
pub const SNAPSHOT_KEY: &str = "rows-v1";

/// Smallest page requested by the boot refresh
const MIN_REFRESH_LIMIT: usize = 24;
/// Smallest number of thumbnails warmed after a refresh
const MIN_BACKGROUND_WARM: usize = 12;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot storage error: {0}")]
    Storage(#[from] KvError),

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Overall grade of a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub letter: Option<String>,
    #[serde(default)]
    pub numeric: Option<f64>,
}

/// One row of the history list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_id: Option<PhotoId>,
    #[serde(default)]
    pub thumb: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub score: Option<Score>,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl From<&ResourceRecord> for HistoryRow {
    fn from(record: &ResourceRecord) -> Self {
        let photo = record.photos.first();
        let score = if record.overall_letter.is_some() || record.overall_numeric.is_some() {
            Some(Score {
                letter: record.overall_letter.clone(),
                numeric: record.overall_numeric,
            })
        } else {
            None
        };

        Self {
            id: record.id,
            photo_id: photo.map(|p| p.id),
            thumb: photo.and_then(|p| p.url.clone()),
            name: record.name.clone(),
            year: record.year,
            score,
            price: record.price.clone(),
            status: record.status.clone(),
            updated_at: record.updated_at.clone(),
        }
    }
}

impl HistoryRow {
    /// Last update time, when the server sent a parseable timestamp
    pub fn updated_at_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.updated_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Equal apart from the signed thumbnail URL, which rotates on every
    /// list fetch
    pub fn same_content(&self, other: &HistoryRow) -> bool {
        self.id == other.id
            && self.photo_id == other.photo_id
            && self.name == other.name
            && self.year == other.year
            && self.score == other.score
            && self.price == other.price
            && self.status == other.status
            && self.updated_at == other.updated_at
    }

    /// Prefetch item for the row's thumbnail
    pub fn prefetch_item(&self) -> Option<PrefetchItem> {
        match (self.photo_id, &self.thumb) {
            (Some(photo_id), Some(uri)) => Some(PrefetchItem {
                uri: uri.clone(),
                key: cache_key(photo_id),
            }),
            _ => None,
        }
    }
}

/// Merge a refreshed list into the previous one. Rows whose content matches
/// their previous version keep the previous allocation, even when only the
/// thumbnail signature changed.
pub fn merge_rows(prev: &[Arc<HistoryRow>], next: Vec<HistoryRow>) -> Vec<Arc<HistoryRow>> {
    let by_id: HashMap<ResourceId, &Arc<HistoryRow>> =
        prev.iter().map(|row| (row.id, row)).collect();

    next.into_iter()
        .map(|row| match by_id.get(&row.id) {
            Some(existing) if existing.same_content(&row) => Arc::clone(existing),
            _ => Arc::new(row),
        })
        .collect()
}

fn prefetch_items<R: Borrow<HistoryRow>>(rows: &[R], n: usize) -> Vec<PrefetchItem> {
    rows.iter()
        .filter_map(|row| Borrow::<HistoryRow>::borrow(row).prefetch_item())
        .take(n)
        .collect()
}

/// Persisted copy of the first rows of the history list
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn KvStore>,
    max_rows: usize,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn KvStore>, max_rows: usize) -> Self {
        Self { store, max_rows }
    }

    /// Load the snapshot. Missing or unreadable snapshots load as empty.
    pub async fn load(&self) -> Vec<HistoryRow> {
        let raw = match self.store.get(SNAPSHOT_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read snapshot");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<HistoryRow>>(&raw) {
            Ok(mut rows) => {
                rows.truncate(self.max_rows);
                rows
            }
            Err(e) => {
                warn!(error = %e, "Discarding corrupt snapshot");
                Vec::new()
            }
        }
    }

    /// Persist the first rows. An empty list leaves the snapshot untouched.
    pub async fn save<R: Borrow<HistoryRow>>(&self, rows: &[R]) -> Result<(), SnapshotError> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows: Vec<&HistoryRow> = rows
            .iter()
            .take(self.max_rows)
            .map(Borrow::<HistoryRow>::borrow)
            .collect();
        let raw = serde_json::to_string(&rows)?;
        self.store.set(SNAPSHOT_KEY, &raw).await?;
        debug!(rows = rows.len(), "Snapshot saved");
        Ok(())
    }
}

/// Where the rows of the first paint came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    None,
    Snapshot,
    Network,
}

impl BootStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BootStage::None => "none",
            BootStage::Snapshot => "snapshot",
            BootStage::Network => "network",
        }
    }
}

/// Result of the boot sequence
pub struct BootReport {
    pub stage: BootStage,
    /// Rows for the first paint
    pub rows: Vec<Arc<HistoryRow>>,
    /// Background network refresh, present when booting from a snapshot
    pub refresh: Option<JoinHandle<Result<Vec<Arc<HistoryRow>>, ApiError>>>,
}

/// Boot sequence for the history list
#[derive(Clone)]
pub struct BootWarmer {
    api: ApiClient,
    snapshot: SnapshotStore,
    thumbnails: Arc<ThumbnailCache>,
    count: usize,
    soft_timeout: Option<Duration>,
}

impl BootWarmer {
    pub fn new(
        api: ApiClient,
        snapshot: SnapshotStore,
        thumbnails: Arc<ThumbnailCache>,
        config: &SnapshotConfig,
    ) -> Self {
        Self {
            api,
            snapshot,
            thumbnails,
            count: config.boot_warm_count,
            soft_timeout: config.soft_timeout(),
        }
    }

    /// Produce the rows of the first paint.
    #[instrument(skip(self))]
    pub async fn boot(&self) -> BootReport {
        let snapshot = self.snapshot.load().await;

        if !snapshot.is_empty() {
            for row in &snapshot {
                if let (Some(photo_id), Some(thumb)) = (row.photo_id, &row.thumb) {
                    self.thumbnails.seed_uri(photo_id, thumb);
                }
            }
            let rows: Vec<Arc<HistoryRow>> = snapshot.into_iter().map(Arc::new).collect();
            self.warm_first(&rows).await;
            info!(rows = rows.len(), "Booted from snapshot");

            let warmer = self.clone();
            let prev = rows.clone();
            let refresh = tokio::spawn(async move {
                let result = warmer.refresh(&prev).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Background refresh failed");
                }
                result
            });

            return BootReport {
                stage: BootStage::Snapshot,
                rows,
                refresh: Some(refresh),
            };
        }

        match self.refresh(&[]).await {
            Ok(rows) => {
                self.warm_first(&rows).await;
                info!(rows = rows.len(), "Booted from network");
                BootReport {
                    stage: BootStage::Network,
                    rows,
                    refresh: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Cold boot refresh failed");
                BootReport {
                    stage: BootStage::None,
                    rows: Vec::new(),
                    refresh: None,
                }
            }
        }
    }

    /// Fetch the list, merge it over `prev`, persist it and queue its first
    /// thumbnails for background warming.
    #[instrument(skip(self, prev), fields(prev = prev.len()))]
    pub async fn refresh(&self, prev: &[Arc<HistoryRow>]) -> Result<Vec<Arc<HistoryRow>>, ApiError> {
        let limit = self.count.max(MIN_REFRESH_LIMIT);
        let page = self.api.list_resources(limit, None).await?;
        let next: Vec<HistoryRow> = page.items.iter().map(HistoryRow::from).collect();

        // Kept rows may carry an older signature; the live URLs go to the
        // stable map, the snapshot and the prefetch queue.
        for row in &next {
            if let (Some(photo_id), Some(thumb)) = (row.photo_id, row.thumb.as_deref()) {
                self.thumbnails.get_stable_uri(Some(photo_id), Some(thumb));
            }
        }
        if let Err(e) = self.snapshot.save(&next).await {
            warn!(error = %e, "Failed to save snapshot");
        }
        let items = prefetch_items(&next, self.count.max(MIN_BACKGROUND_WARM));

        let rows = merge_rows(prev, next);
        self.thumbnails.enqueue_prefetch(items);

        debug!(rows = rows.len(), total = ?page.total, "History refreshed");
        Ok(rows)
    }

    /// Warm the first thumbnails, giving up after the soft timeout. Items
    /// still cold at that point move to the background queue.
    async fn warm_first(&self, rows: &[Arc<HistoryRow>]) {
        let items = prefetch_items(rows, self.count);
        if items.is_empty() {
            return;
        }

        let Some(limit) = self.soft_timeout else {
            self.thumbnails.warm_now(&items).await;
            return;
        };

        if tokio::time::timeout(limit, self.thumbnails.warm_now(&items))
            .await
            .is_err()
        {
            let warm = self.thumbnails.warm_set();
            let cold: Vec<PrefetchItem> = items
                .into_iter()
                .filter(|item| !warm.contains(&item.key))
                .collect();
            debug!(cold = cold.len(), "Soft timeout reached, continuing in background");
            self.thumbnails.enqueue_prefetch(cold);
        }
    }
}
