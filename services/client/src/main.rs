//! Watchscan command line client
//!
//! Modes:
//! - `scan <photo>...`: normalize, upload, stream the analysis, print the result
//! - `history`: boot the history list and print its rows
//! - `session`: print the anonymous client id

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use watchscan_client::{
    AnalysisRunner, ApiClient, BootWarmer, Config, FileKvStore, HttpImageWarmer, ImageNormalizer,
    KvStore, SessionManager, SnapshotStore, ThumbnailCache, UploadOrchestrator,
};

/// Shared components built once per process
struct Client {
    config: Config,
    api: ApiClient,
    thumbnails: Arc<ThumbnailCache>,
    store: Arc<dyn KvStore>,
}

impl Client {
    fn build(config: Config) -> Result<Self> {
        let store: Arc<dyn KvStore> = Arc::new(FileKvStore::new(config.service.state_dir.clone()));
        let session = Arc::new(
            SessionManager::new(&config.api.base_url, store.clone())
                .context("Failed to initialize session manager")?,
        );
        let api = ApiClient::new(&config.api, session).context("Failed to initialize API client")?;

        let warmer = Arc::new(HttpImageWarmer::new(
            reqwest::Client::new(),
            config.thumbnails.byte_cache_entries,
        ));
        let thumbnails = Arc::new(ThumbnailCache::new(&config.thumbnails, warmer));

        Ok(Self {
            config,
            api,
            thumbnails,
            store,
        })
    }
}

async fn run_scan(client: &Client, photos: Vec<PathBuf>) -> Result<()> {
    if photos.is_empty() {
        bail!("scan needs at least one photo");
    }

    let orchestrator = UploadOrchestrator::new(
        client.api.clone(),
        ImageNormalizer::from_config(&client.config.upload),
        client.config.upload.concurrency,
    )
    .with_thumbnails(client.thumbnails.clone());

    let finalized = orchestrator
        .capture(&photos, client.config.upload.max_edge)
        .await
        .context("Upload failed")?;
    info!(resource_id = %finalized.resource_id, "Photos uploaded, waiting for analysis");

    let runner = AnalysisRunner::new(client.api.clone(), client.config.analysis.clone());
    let outcome = runner
        .spawn(finalized.resource_id)
        .outcome()
        .await
        .context("Analysis failed")?;

    let output = json!({
        "resourceId": finalized.resource_id,
        "record": outcome.record,
        "sections": outcome.sections,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_history(client: &Client) -> Result<()> {
    let snapshot = SnapshotStore::new(client.store.clone(), client.config.snapshot.max_rows);
    let boot = BootWarmer::new(
        client.api.clone(),
        snapshot,
        client.thumbnails.clone(),
        &client.config.snapshot,
    );

    let report = boot.boot().await;
    info!(stage = report.stage.as_str(), rows = report.rows.len(), "History ready");

    let mut rows = report.rows;
    if let Some(refresh) = report.refresh {
        match refresh.await.context("Refresh task failed")? {
            Ok(fresh) => rows = fresh,
            Err(e) => error!(error = %e, "Refresh failed, showing snapshot"),
        }
    }

    for row in &rows {
        let thumb = client
            .thumbnails
            .get_stable_uri(row.photo_id, row.thumb.as_deref());
        let line = json!({
            "id": row.id,
            "name": row.name,
            "year": row.year,
            "score": row.score,
            "status": row.status,
            "updatedAt": row.updated_at_utc().map(|t| t.to_rfc3339()),
            "thumb": thumb,
        });
        println!("{line}");
    }

    client.thumbnails.prefetch_queue().wait_idle().await;
    Ok(())
}

async fn run_session(client: &Client) -> Result<()> {
    let session = client
        .api
        .session()
        .ensure()
        .await
        .context("Session bootstrap failed")?;
    println!("{}", session.client_id);
    Ok(())
}

async fn run(client: Client, args: Vec<String>) -> Result<()> {
    match args.first().map(String::as_str) {
        Some("scan") => run_scan(&client, args[1..].iter().map(PathBuf::from).collect()).await,
        Some("history") => run_history(&client).await,
        Some("session") => run_session(&client).await,
        Some(other) => bail!("Unknown mode: {other}. Use: scan <photo>..., history, or session"),
        None => bail!("Usage: watchscan <scan <photo>...|history|session>"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        api = %config.api.base_url,
        "Starting watchscan client"
    );

    let client = Client::build(config)?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    tokio::select! {
        result = run(client, args) => result,
        _ = shutdown_signal() => {
            info!("Interrupted");
            Ok(())
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

/// Wait for Ctrl+C
async fn shutdown_signal() {
    signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received Ctrl+C signal");
}
