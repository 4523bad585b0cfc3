use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the capture client
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Photo normalization and upload configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Analysis stream configuration
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Thumbnail cache configuration
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    /// History snapshot and boot warm configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for durable local state (session, history snapshot)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// API endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the API server
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path segment of the resource collection (`/watches/...`)
    #[serde(default = "default_resource_kind")]
    pub resource_kind: String,
    /// Timeout for plain request/response calls in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Normalization and upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Longest edge after normalization in pixels
    #[serde(default = "default_max_edge")]
    pub max_edge: u32,
    /// JPEG quality factor (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Number of PUTs in flight at once (1 = sequential)
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    /// Directory for normalized temporary files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

/// Analysis stream configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Sections requested from the stream
    #[serde(default = "default_sections")]
    pub sections: Vec<String>,
    /// Section required before navigating to results
    #[serde(default = "default_gating_section")]
    pub gating_section: String,
    /// Server-side wait timeout in seconds
    #[serde(default = "default_stream_timeout_secs")]
    pub timeout_secs: u64,
    /// Frame channel capacity between the reader and the state machine
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
}

/// Thumbnail identity cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailConfig {
    /// Window after which a stable URI may be replaced by a fresh one
    #[serde(default = "default_stable_uri_ttl_secs")]
    pub stable_uri_ttl_secs: u64,
    /// Number of prefetch workers
    #[serde(default = "default_prefetch_concurrency")]
    pub prefetch_concurrency: usize,
    /// Items taken per worker pull
    #[serde(default = "default_prefetch_batch_size")]
    pub prefetch_batch_size: usize,
    /// Maximum warm keys retained (0 = unbounded)
    #[serde(default = "default_warm_capacity")]
    pub warm_capacity: usize,
    /// Maximum image payloads kept by the HTTP warmer
    #[serde(default = "default_byte_cache_entries")]
    pub byte_cache_entries: usize,
}

/// History snapshot configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Maximum rows persisted
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    /// Rows warmed before first paint
    #[serde(default = "default_boot_warm_count")]
    pub boot_warm_count: usize,
    /// Soft timeout for the boot warm in milliseconds (0 = no timeout)
    #[serde(default = "default_soft_timeout_ms")]
    pub soft_timeout_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "watchscan-client".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".watchscan")
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_resource_kind() -> String {
    "watches".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_edge() -> u32 {
    1600
}

fn default_jpeg_quality() -> u8 {
    75
}

fn default_upload_concurrency() -> usize {
    1
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("watchscan")
}

fn default_sections() -> Vec<String> {
    vec!["quick_facts".to_string(), "overall".to_string()]
}

fn default_gating_section() -> String {
    "quick_facts".to_string()
}

fn default_stream_timeout_secs() -> u64 {
    45
}

fn default_frame_buffer() -> usize {
    64
}

fn default_stable_uri_ttl_secs() -> u64 {
    30 * 60 // roughly the presigned GET lifetime
}

fn default_prefetch_concurrency() -> usize {
    3
}

fn default_prefetch_batch_size() -> usize {
    4
}

fn default_warm_capacity() -> usize {
    4096
}

fn default_byte_cache_entries() -> usize {
    256
}

fn default_max_rows() -> usize {
    50
}

fn default_boot_warm_count() -> usize {
    8
}

fn default_soft_timeout_ms() -> u64 {
    800
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "watchscan-client")?
            .set_default("service.log_level", "info")?
            // Add config file if present
            .add_source(config::File::with_name("config/client").required(false))
            .add_source(config::File::with_name("/etc/watchscan/client").required(false))
            // Override with environment variables
            // WATCHSCAN__API__BASE_URL -> api.base_url
            .add_source(
                config::Environment::with_prefix("WATCHSCAN")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("analysis.sections"),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl ApiConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AnalysisConfig {
    /// Server-side stream timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ThumbnailConfig {
    /// Warm set capacity, `None` when unbounded
    pub fn warm_capacity(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.warm_capacity)
    }

    pub fn stable_uri_ttl(&self) -> Duration {
        Duration::from_secs(self.stable_uri_ttl_secs)
    }
}

impl SnapshotConfig {
    /// Boot warm soft timeout, if one is configured
    pub fn soft_timeout(&self) -> Option<Duration> {
        match self.soft_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            resource_kind: default_resource_kind(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_edge: default_max_edge(),
            jpeg_quality: default_jpeg_quality(),
            concurrency: default_upload_concurrency(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sections: default_sections(),
            gating_section: default_gating_section(),
            timeout_secs: default_stream_timeout_secs(),
            frame_buffer: default_frame_buffer(),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            stable_uri_ttl_secs: default_stable_uri_ttl_secs(),
            prefetch_concurrency: default_prefetch_concurrency(),
            prefetch_batch_size: default_prefetch_batch_size(),
            warm_capacity: default_warm_capacity(),
            byte_cache_entries: default_byte_cache_entries(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            boot_warm_count: default_boot_warm_count(),
            soft_timeout_ms: default_soft_timeout_ms(),
        }
    }
}
