//! Direct-to-storage upload of a capture session.
//!
//! The server hands out one presigned target per photo; bytes go straight to
//! object storage and the resource is finalized with the object keys once
//! every PUT has succeeded.

use crate::api::{ApiClient, ApiError, ResourceId, ResourceRecord};
use crate::normalizer::{ImageNormalizer, NormalizeError, NormalizedBlob};
use crate::thumbnails::ThumbnailCache;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument};

/// Errors that can occur during an upload session
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Upload failed: {0}")]
    Api(#[from] ApiError),

    #[error("Failed to read normalized photo: {0}")]
    Io(#[from] std::io::Error),
}

/// A resource whose photos are stored and finalized
#[derive(Debug, Clone)]
pub struct FinalizedResource {
    pub resource_id: ResourceId,
    /// Object keys in presign order
    pub object_keys: Vec<String>,
    pub record: ResourceRecord,
}

/// Runs presign, PUT and finalize for one capture
pub struct UploadOrchestrator {
    api: ApiClient,
    normalizer: ImageNormalizer,
    thumbnails: Option<Arc<ThumbnailCache>>,
    concurrency: usize,
}

impl UploadOrchestrator {
    pub fn new(api: ApiClient, normalizer: ImageNormalizer, concurrency: usize) -> Self {
        Self {
            api,
            normalizer,
            thumbnails: None,
            concurrency: concurrency.max(1),
        }
    }

    /// Bump finalized photo URLs into `cache`.
    pub fn with_thumbnails(mut self, cache: Arc<ThumbnailCache>) -> Self {
        self.thumbnails = Some(cache);
        self
    }

    /// Normalize photos from disk, in order, then upload them.
    #[instrument(skip(self, paths), fields(photos = paths.len()))]
    pub async fn capture(
        &self,
        paths: &[PathBuf],
        max_edge: u32,
    ) -> Result<FinalizedResource, UploadError> {
        let mut blobs = Vec::with_capacity(paths.len());
        for path in paths {
            match self.normalizer.normalize(path, max_edge).await {
                Ok(blob) => blobs.push(blob),
                Err(e) => {
                    discard_all(blobs).await;
                    return Err(e.into());
                }
            }
        }
        self.upload(blobs).await
    }

    /// Upload normalized blobs and finalize the resource. The blobs are
    /// discarded whether or not the session succeeds.
    #[instrument(skip(self, blobs), fields(photos = blobs.len()))]
    pub async fn upload(&self, blobs: Vec<NormalizedBlob>) -> Result<FinalizedResource, UploadError> {
        let result = self.upload_inner(&blobs).await;
        discard_all(blobs).await;

        if let Err(e) = &result {
            metrics::counter!("capture.uploads.failed").increment(1);
            error!(error = %e, "Upload session failed");
        }
        result
    }

    async fn upload_inner(&self, blobs: &[NormalizedBlob]) -> Result<FinalizedResource, UploadError> {
        if blobs.is_empty() {
            return Err(UploadError::ContractViolation(
                "no photos to upload".to_string(),
            ));
        }

        let start = Instant::now();
        let content_types: Vec<String> = blobs.iter().map(|b| b.content_type.clone()).collect();
        let presign = self.api.init_presign(blobs.len(), &content_types).await?;
        let resource_id = presign.resource_id;

        if presign.uploads.len() != blobs.len() {
            return Err(UploadError::ContractViolation(format!(
                "requested {} upload targets, received {}",
                blobs.len(),
                presign.uploads.len()
            )));
        }

        // `buffered` yields in input order, so keys line up with the presign
        let object_keys: Vec<String> = stream::iter(blobs.iter().zip(presign.uploads.iter()))
            .map(|(blob, target)| async move {
                let body = blob.bytes().await?;
                let len = body.len() as u64;
                self.api.put_object(target, body).await?;
                metrics::counter!("capture.uploads.bytes").increment(len);
                Ok::<_, UploadError>(target.object_key.clone())
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let record = self.api.finalize(resource_id, &object_keys).await?;

        if let Some(cache) = &self.thumbnails {
            for photo in &record.photos {
                if let Some(url) = &photo.url {
                    cache.bump_uri(photo.id, url);
                }
            }
        }

        info!(
            resource_id = %resource_id,
            photos = object_keys.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Resource finalized"
        );

        Ok(FinalizedResource {
            resource_id,
            object_keys,
            record,
        })
    }
}

async fn discard_all(blobs: Vec<NormalizedBlob>) {
    for blob in blobs {
        blob.discard().await;
    }
}
