//! Watchscan Client
//!
//! Capture-side core of the watch scanning app. Photos taken on the device
//! are normalized, uploaded straight to object storage through presigned
//! targets, and analyzed by the server while the client listens on an event
//! stream. Thumbnails of past scans are kept visually stable across the
//! signed-URL churn of the list API.
//!
//! ## Features
//!
//! - **Normalization**: downscale to a bounded longest edge and re-encode to
//!   one output format
//! - **Direct Uploads**: presign, PUT with exactly the signed headers, finalize
//! - **Streamed Analysis**: incremental frame parsing, section merging, and a
//!   single hand-off once the gating section and the record are both in
//! - **Stable Thumbnails**: URI pinning with a TTL, warm/paint bookkeeping and
//!   a bounded prefetch pool
//! - **Fast Boot**: persisted history snapshot warmed before the first paint
//!
//! ## Architecture
//!
//! ```text
//!  photos ──▶ ImageNormalizer ──▶ UploadOrchestrator ──▶ presign / PUT / finalize
//!                                        │
//!                                        ▼ ResourceId
//!                                 AnalysisRunner ◀── FrameStream ◀── analyze-stream
//!                                        │      ◀── GET record
//!                                        ▼
//!                                 AnalysisOutcome
//!
//!  SnapshotStore ──▶ BootWarmer ──▶ ThumbnailCache ◀── PrefetchQueue
//! ```

pub mod analysis;
pub mod api;
pub mod config;
pub mod kv;
pub mod normalizer;
pub mod prefetch;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod thumbnails;
pub mod uploader;

pub use analysis::{
    AnalysisController, AnalysisError, AnalysisOutcome, AnalysisRunner, AnalysisState, Transition,
};
pub use api::{ApiClient, ApiError, PhotoId, ResourceId, ResourceRecord, UploadTarget};
pub use config::Config;
pub use kv::{FileKvStore, KvError, KvStore, MemoryKvStore};
pub use normalizer::{ImageNormalizer, NormalizeError, NormalizedBlob};
pub use prefetch::{HttpImageWarmer, ImageWarmer, PrefetchItem, PrefetchQueue};
pub use session::{Session, SessionManager};
pub use snapshot::{BootReport, BootStage, BootWarmer, HistoryRow, SnapshotStore};
pub use stream::{FrameData, FrameParser, FrameStream, StreamFrame};
pub use thumbnails::{cache_key, RenderDecision, ThumbnailCache, ThumbnailView};
pub use uploader::{FinalizedResource, UploadError, UploadOrchestrator};
