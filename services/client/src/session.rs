//! Anonymous session bootstrap.
//!
//! The first API call of a fresh install obtains `{clientId, apiKey}` from
//! `POST /session/anon`. The pair is persisted and attached to every later
//! call as `X-Client-Id` and a bearer credential.

use crate::api::{api_base_url, body_snippet, ApiError};
use crate::kv::KvStore;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};

const CLIENT_ID_KEY: &str = "clientId";
const API_KEY_KEY: &str = "apiKey";

/// Caller identity header
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Anonymous API credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub client_id: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnonSessionResponse {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

/// Loads, bootstraps and caches the anonymous session
pub struct SessionManager {
    http: reqwest::Client,
    base_url: Url,
    store: Arc<dyn KvStore>,
    cached: Mutex<Option<Session>>,
    // Single-flight guard so concurrent first calls bootstrap once
    bootstrap: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(base_url: &str, store: Arc<dyn KvStore>) -> Result<Self, ApiError> {
        let base_url = api_base_url(base_url)?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            store,
            cached: Mutex::new(None),
            bootstrap: tokio::sync::Mutex::new(()),
        })
    }

    /// Return the current session, creating one if none is stored.
    pub async fn ensure(&self) -> Result<Session, ApiError> {
        if let Some(session) = self.cached.lock().clone() {
            return Ok(session);
        }

        let _flight = self.bootstrap.lock().await;
        if let Some(session) = self.cached.lock().clone() {
            return Ok(session);
        }

        let session = match self.load().await? {
            Some(session) => session,
            None => {
                let session = self.request_anonymous().await?;
                self.store.set(CLIENT_ID_KEY, &session.client_id).await?;
                self.store.set(API_KEY_KEY, &session.api_key).await?;
                info!(client_id = %session.client_id, "Anonymous session created");
                session
            }
        };

        *self.cached.lock() = Some(session.clone());
        Ok(session)
    }

    /// Headers identifying the caller on every API call.
    pub async fn auth_headers(&self) -> Result<HeaderMap, ApiError> {
        let session = self.ensure().await?;

        let invalid = |name: &str, e: reqwest::header::InvalidHeaderValue| ApiError::InvalidHeader {
            name: name.to_string(),
            message: e.to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(CLIENT_ID_HEADER),
            HeaderValue::from_str(&session.client_id).map_err(|e| invalid(CLIENT_ID_HEADER, e))?,
        );
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", session.api_key))
            .map_err(|e| invalid("authorization", e))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// Forget the session locally; the next call bootstraps a new one.
    pub async fn clear(&self) -> Result<(), ApiError> {
        *self.cached.lock() = None;
        self.store.remove(CLIENT_ID_KEY).await?;
        self.store.remove(API_KEY_KEY).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Session>, ApiError> {
        let client_id = self.store.get(CLIENT_ID_KEY).await?;
        let api_key = self.store.get(API_KEY_KEY).await?;
        match (client_id, api_key) {
            (Some(client_id), Some(api_key)) if !client_id.is_empty() && !api_key.is_empty() => {
                Ok(Some(Session { client_id, api_key }))
            }
            _ => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn request_anonymous(&self) -> Result<Session, ApiError> {
        let url = self
            .base_url
            .join("session/anon")
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        let response = self.http.post(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Session(format!(
                "session/anon failed: {} {}",
                status.as_u16(),
                body_snippet(&body)
            )));
        }

        let parsed: AnonSessionResponse = serde_json::from_str(&body)
            .map_err(|_| ApiError::Session("session/anon returned non-JSON".to_string()))?;

        match (parsed.client_id, parsed.api_key) {
            (Some(client_id), Some(api_key)) if !client_id.is_empty() && !api_key.is_empty() => {
                Ok(Session { client_id, api_key })
            }
            _ => Err(ApiError::Session(format!(
                "Bad session payload: {}",
                body_snippet(&body)
            ))),
        }
    }
}
