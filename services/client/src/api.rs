//! Typed HTTP client for the scan API and presigned storage targets.

use crate::config::ApiConfig;
use crate::kv::KvError;
use crate::session::SessionManager;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use reqwest::header::{HeaderName, HeaderValue, ACCEPT};
use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Longest slice of a response body carried in an error
const ERROR_BODY_LIMIT: usize = 200;

/// Errors that can occur when talking to the API or to object storage
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header {name}: {message}")]
    InvalidHeader { name: String, message: String },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Storage request failed: {0}")]
    StorageTransport(String),

    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Session bootstrap failed: {0}")]
    Session(String),

    #[error("Session storage error: {0}")]
    Storage(#[from] KvError),
}

impl ApiError {
    /// HTTP status for errors produced by a non-2xx response
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Server-issued identifier of a scan record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub i64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Photo identifier assigned by the server
pub type PhotoId = i64;

/// Presign request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPresignRequest {
    pub count: usize,
    pub content_types: Vec<String>,
}

/// One direct-to-storage upload slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    /// Object key reported back on finalize
    #[serde(rename = "key")]
    pub object_key: String,
    /// Presigned PUT URL
    pub upload_url: String,
    /// Headers the storage signature was computed over
    #[serde(rename = "headers", default)]
    pub required_headers: BTreeMap<String, String>,
}

/// Presign response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    #[serde(alias = "watchId")]
    pub resource_id: ResourceId,
    #[serde(default)]
    pub uploads: Vec<UploadTarget>,
}

#[derive(Debug, Serialize)]
struct PhotoKey<'a> {
    key: &'a str,
}

#[derive(Debug, Serialize)]
struct FinalizeRequest<'a> {
    photos: Vec<PhotoKey<'a>>,
    analyze: bool,
}

/// Photo reference inside a resource record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRef {
    pub id: PhotoId,
    #[serde(default)]
    pub key: Option<String>,
    /// Signed GET URL
    #[serde(default)]
    pub url: Option<String>,
}

/// Canonical scan record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub id: ResourceId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub overall_letter: Option<String>,
    #[serde(default)]
    pub overall_numeric: Option<f64>,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub photos: Vec<PhotoRef>,
    /// Fields not modelled here (`ai`, `analysis`, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One page of the resource list
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePage {
    #[serde(default)]
    pub items: Vec<ResourceRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Query of the analysis stream endpoint
#[derive(Debug, Clone)]
pub struct StreamQuery {
    pub sections: Vec<String>,
    pub timeout: Duration,
}

/// Client for presigned storage targets. Unlike `reqwest`, it adds no
/// default headers beyond `host` and `content-length`.
type StorageClient = hyper_util::client::legacy::Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

fn storage_client() -> Result<StorageClient, ApiError> {
    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|e| ApiError::StorageTransport(e.to_string()))?
        .https_or_http()
        .enable_http1()
        .build();
    Ok(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https))
}

/// Parse the API base URL so relative joins keep any path prefix.
pub(crate) fn api_base_url(raw: &str) -> Result<Url, ApiError> {
    let mut url = Url::parse(raw).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// API client
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    storage: StorageClient,
    base_url: Url,
    resource_kind: String,
    request_timeout: Duration,
    session: Arc<SessionManager>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, session: Arc<SessionManager>) -> Result<Self, ApiError> {
        let base_url = api_base_url(&config.base_url)?;
        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            http,
            storage: storage_client()?,
            base_url,
            resource_kind: config.resource_kind.trim_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            session,
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    fn resource_url(&self, suffix: &str) -> Result<Url, ApiError> {
        self.url(&format!("{}{}", self.resource_kind, suffix))
    }

    /// Attach caller identity and credentials
    async fn authed(&self, req: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let headers = self.session.auth_headers().await?;
        Ok(req.headers(headers))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let response = self
            .authed(req.timeout(self.request_timeout))
            .await?
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: body_snippet(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Request `count` presigned upload targets.
    #[instrument(skip(self, content_types))]
    pub async fn init_presign(
        &self,
        count: usize,
        content_types: &[String],
    ) -> Result<PresignResponse, ApiError> {
        let url = self.resource_url("/init")?;
        let body = InitPresignRequest {
            count,
            content_types: content_types.to_vec(),
        };
        self.send_json(self.http.post(url).json(&body)).await
    }

    /// PUT raw bytes to a presigned target with exactly its required headers.
    ///
    /// No API credentials are attached; the storage signature covers the
    /// target's headers only.
    #[instrument(skip(self, target, body), fields(key = %target.object_key, bytes = body.len()))]
    pub async fn put_object(&self, target: &UploadTarget, body: Bytes) -> Result<(), ApiError> {
        let url =
            Url::parse(&target.upload_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        let mut req = hyper::Request::builder()
            .method(hyper::Method::PUT)
            .uri(url.as_str());
        for (name, value) in &target.required_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ApiError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                }
            })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| ApiError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            req = req.header(header_name, header_value);
        }
        let req = req
            .body(Full::new(body))
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        let response = self
            .storage
            .request(req)
            .await
            .map_err(|e| ApiError::StorageTransport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ApiError::StorageTransport(e.to_string()))?
                .to_bytes();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: body_snippet(&String::from_utf8_lossy(&body)),
            });
        }

        debug!(status = status.as_u16(), "Object stored");
        Ok(())
    }

    /// Finalize a resource with the uploaded object keys, in order.
    #[instrument(skip(self, keys), fields(resource_id = %resource_id, photos = keys.len()))]
    pub async fn finalize(
        &self,
        resource_id: ResourceId,
        keys: &[String],
    ) -> Result<ResourceRecord, ApiError> {
        let url = self.resource_url(&format!("/{resource_id}/finalize"))?;
        let body = FinalizeRequest {
            photos: keys.iter().map(|key| PhotoKey { key }).collect(),
            analyze: true,
        };
        self.send_json(self.http.post(url).json(&body)).await
    }

    /// Fetch the canonical record.
    #[instrument(skip(self))]
    pub async fn get_resource(&self, resource_id: ResourceId) -> Result<ResourceRecord, ApiError> {
        let url = self.resource_url(&format!("/{resource_id}"))?;
        self.send_json(self.http.get(url)).await
    }

    /// Fetch one page of the resource list.
    #[instrument(skip(self))]
    pub async fn list_resources(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ResourcePage, ApiError> {
        let mut url = self.resource_url("")?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        self.send_json(self.http.get(url)).await
    }

    /// Build the analysis stream request. No request timeout is applied; the
    /// server closes the stream after `query.timeout`.
    pub async fn analysis_stream_request(
        &self,
        resource_id: ResourceId,
        query: &StreamQuery,
    ) -> Result<RequestBuilder, ApiError> {
        let mut url = self.resource_url(&format!("/{resource_id}/analyze-stream"))?;
        url.query_pairs_mut()
            .append_pair("sections", &query.sections.join(","))
            .append_pair("wait", "1")
            .append_pair("timeout", &query.timeout.as_secs().to_string());

        let req = self
            .http
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        self.authed(req).await
    }
}

/// Truncate a response body for error messages
pub(crate) fn body_snippet(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presign_response_accepts_legacy_id() {
        let response: PresignResponse = serde_json::from_value(json!({
            "watchId": 42,
            "uploads": [{
                "key": "uploads/42/0.jpg",
                "uploadUrl": "https://bucket.example/uploads/42/0.jpg?sig=abc",
                "headers": { "Content-Type": "image/jpeg" }
            }]
        }))
        .unwrap();

        assert_eq!(response.resource_id, ResourceId(42));
        assert_eq!(response.uploads.len(), 1);
        assert_eq!(response.uploads[0].object_key, "uploads/42/0.jpg");
        assert_eq!(
            response.uploads[0].required_headers.get("Content-Type").map(String::as_str),
            Some("image/jpeg")
        );
    }

    #[test]
    fn test_resource_record_keeps_unknown_fields() {
        let record: ResourceRecord = serde_json::from_value(json!({
            "id": 7,
            "name": "Speedmaster",
            "overallLetter": "A",
            "overallNumeric": 91.5,
            "photos": [{ "id": 70, "url": "https://cdn.example/70.jpg?sig=1" }],
            "ai": { "quick_facts": { "name": "Speedmaster" } }
        }))
        .unwrap();

        assert_eq!(record.id, ResourceId(7));
        assert_eq!(record.overall_letter.as_deref(), Some("A"));
        assert_eq!(record.photos[0].id, 70);
        assert!(record.extra.contains_key("ai"));
    }

    #[test]
    fn test_body_snippet_truncates_on_char_boundary() {
        let body = "é".repeat(300);
        let snippet = body_snippet(&body);
        assert_eq!(snippet.chars().count(), ERROR_BODY_LIMIT);
    }

    #[test]
    fn test_base_url_keeps_path_prefix() {
        let url = api_base_url("https://host.example/api").unwrap();
        assert_eq!(url.as_str(), "https://host.example/api/");
        assert_eq!(
            url.join("watches/init").unwrap().as_str(),
            "https://host.example/api/watches/init"
        );

        let root = api_base_url("https://host.example").unwrap();
        assert_eq!(
            root.join("watches").unwrap().as_str(),
            "https://host.example/watches"
        );
    }

    #[test]
    fn test_resource_urls_under_path_prefix() {
        let config = ApiConfig {
            base_url: "https://host.example/api".to_string(),
            ..ApiConfig::default()
        };
        let session = Arc::new(
            SessionManager::new(&config.base_url, Arc::new(crate::kv::MemoryKvStore::new()))
                .unwrap(),
        );
        let client = ApiClient::new(&config, session).unwrap();

        assert_eq!(
            client.resource_url("/init").unwrap().as_str(),
            "https://host.example/api/watches/init"
        );
        assert_eq!(
            client.resource_url("/7/finalize").unwrap().as_str(),
            "https://host.example/api/watches/7/finalize"
        );
    }

    #[test]
    fn test_status_accessor() {
        let err = ApiError::Status {
            status: 403,
            body: "SignatureDoesNotMatch".to_string(),
        };
        assert_eq!(err.status(), Some(403));
        assert_eq!(ApiError::Decode("x".into()).status(), None);
    }
}
