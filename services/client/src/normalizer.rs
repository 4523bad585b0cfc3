//! Photo normalization before upload.
//!
//! Every captured photo is re-encoded to a single output format and quality.
//! Photos whose longest edge exceeds the configured bound are scaled down
//! uniformly first.

use crate::config::UploadConfig;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Content type of every normalized blob
pub const OUTPUT_CONTENT_TYPE: &str = "image/jpeg";

/// Errors that can occur during normalization.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Failed to decode image {path}: {message}")]
    DecodeFailed { path: PathBuf, message: String },

    #[error("Failed to encode image: {0}")]
    EncodeFailed(String),

    #[error("Normalization I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Normalization task failed: {0}")]
    TaskFailed(String),
}

/// A re-encoded photo ready for upload.
///
/// The blob owns its temporary file; [`NormalizedBlob::discard`] removes it.
#[derive(Debug, Clone)]
pub struct NormalizedBlob {
    /// Location of the encoded bytes
    pub local_path: PathBuf,
    /// MIME type sent with the presign request and the PUT
    pub content_type: String,
    /// Output width in pixels (0 when not produced by the normalizer)
    pub width: u32,
    /// Output height in pixels (0 when not produced by the normalizer)
    pub height: u32,
    /// Encoded size in bytes
    pub byte_len: u64,
}

impl NormalizedBlob {
    /// Wrap an already-encoded file.
    pub async fn from_file(
        path: impl Into<PathBuf>,
        content_type: impl Into<String>,
    ) -> Result<Self, NormalizeError> {
        let local_path = path.into();
        let byte_len = tokio::fs::metadata(&local_path).await?.len();
        Ok(Self {
            local_path,
            content_type: content_type.into(),
            width: 0,
            height: 0,
            byte_len,
        })
    }

    /// Read the encoded bytes.
    pub async fn bytes(&self) -> std::io::Result<Bytes> {
        tokio::fs::read(&self.local_path).await.map(Bytes::from)
    }

    /// Remove the backing file.
    pub async fn discard(self) {
        if let Err(e) = tokio::fs::remove_file(&self.local_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.local_path.display(), error = %e, "Failed to remove normalized blob");
            }
        }
    }
}

/// Compute the resize target for an image, `None` when it already fits.
pub fn target_dimensions(width: u32, height: u32, max_edge: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if longest <= max_edge || longest == 0 {
        return None;
    }

    let scale = max_edge as f64 / longest as f64;
    let target_w = ((width as f64 * scale).round() as u32).max(1);
    let target_h = ((height as f64 * scale).round() as u32).max(1);
    Some((target_w, target_h))
}

/// Normalizer writing re-encoded photos into a temporary directory.
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    temp_dir: PathBuf,
    quality: u8,
}

impl ImageNormalizer {
    pub fn new(temp_dir: impl Into<PathBuf>, quality: u8) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.temp_dir.clone(), config.jpeg_quality)
    }

    /// Normalize the photo at `source` to at most `max_edge` pixels on its
    /// longest side. The source file is left untouched.
    #[instrument(skip(self), fields(source = %source.display()))]
    pub async fn normalize(
        &self,
        source: &Path,
        max_edge: u32,
    ) -> Result<NormalizedBlob, NormalizeError> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let source = source.to_path_buf();
        let output = self
            .temp_dir
            .join(format!("{}.jpg", uuid::Uuid::new_v4()));
        let quality = self.quality;

        let (width, height, byte_len) = {
            let output = output.clone();
            tokio::task::spawn_blocking(move || {
                normalize_blocking(&source, &output, max_edge, quality)
            })
            .await
            .map_err(|e| NormalizeError::TaskFailed(e.to_string()))??
        };

        Ok(NormalizedBlob {
            local_path: output,
            content_type: OUTPUT_CONTENT_TYPE.to_string(),
            width,
            height,
            byte_len,
        })
    }
}

fn normalize_blocking(
    source: &Path,
    output: &Path,
    max_edge: u32,
    quality: u8,
) -> Result<(u32, u32, u64), NormalizeError> {
    let start = Instant::now();

    // Header read; an unreadable header means re-encode as-is
    let target = match image::image_dimensions(source) {
        Ok((w, h)) => target_dimensions(w, h, max_edge),
        Err(e) => {
            debug!(error = %e, "Could not read dimensions, re-encoding without resize");
            None
        }
    };

    let decoded = decode(source)?;
    let (original_w, original_h) = (decoded.width(), decoded.height());
    let image = match target {
        Some((w, h)) => decoded.resize_exact(w, h, FilterType::Lanczos3),
        None => decoded,
    };

    let encoded = encode_jpeg(&image, quality)?;
    std::fs::write(output, &encoded)?;

    debug!(
        original_size = format!("{}x{}", original_w, original_h),
        output_size = format!("{}x{}", image.width(), image.height()),
        bytes = encoded.len(),
        processing_time_us = start.elapsed().as_micros() as u64,
        "Photo normalized"
    );

    Ok((image.width(), image.height(), encoded.len() as u64))
}

fn decode(source: &Path) -> Result<DynamicImage, NormalizeError> {
    let decode_err = |message: String| NormalizeError::DecodeFailed {
        path: source.to_path_buf(),
        message,
    };

    ImageReader::open(source)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| decode_err(e.to_string()))
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, NormalizeError> {
    // JPEG has no alpha channel
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| NormalizeError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}
