//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use httpmock::MockServer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use watchscan_client::config::ApiConfig;
use watchscan_client::prefetch::WarmError;
use watchscan_client::{ApiClient, ImageWarmer, KvStore, MemoryKvStore, SessionManager};

pub const CLIENT_ID: &str = "client-1";
pub const API_KEY: &str = "key-1";

/// Store holding an already bootstrapped session
pub async fn session_store() -> Arc<MemoryKvStore> {
    let store = Arc::new(MemoryKvStore::new());
    store.set("clientId", CLIENT_ID).await.unwrap();
    store.set("apiKey", API_KEY).await.unwrap();
    store
}

pub async fn api_client(server: &MockServer, store: Arc<MemoryKvStore>) -> ApiClient {
    let config = ApiConfig {
        base_url: server.base_url(),
        ..ApiConfig::default()
    };
    let session = Arc::new(SessionManager::new(&config.base_url, store).unwrap());
    ApiClient::new(&config, session).unwrap()
}

/// Warmer that always succeeds and counts calls
#[derive(Default)]
pub struct CountingWarmer {
    pub calls: AtomicUsize,
}

impl CountingWarmer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageWarmer for CountingWarmer {
    async fn prefetch(&self, _uri: &str) -> Result<(), WarmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn prefetch_fallback(&self, _uri: &str) -> Result<(), WarmError> {
        Ok(())
    }
}
