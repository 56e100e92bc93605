//! Typed HTTP client for the ring builder API.
//!
//! Every call sends the shared key; writes send the token the caller last saw. A write
//! that finds the category locked is retried with jittered exponential backoff. A stale
//! token is never retried: the caller has to fetch the catalog again and decide.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::catalog::types::{Category, DeviceId, DeviceSpec};
use crate::error::ErrorResponse;
use crate::mutation::protocol::{
    ENDPOINT_BUILDER, ENDPOINT_RING, HEADER_CURRENT_HASH, HEADER_KEY, HEADER_LAST_HASH,
    ListResponse, RebalanceResponse, SearchResponse, WriteResponse,
};
use crate::store::version::VersionToken;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{status}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
        /// Current token, when the server sent one (e.g. an unchanged add).
        hash: Option<VersionToken>,
    },

    #[error("response carries no X-Current-Hash header")]
    MissingHash,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status(),
            ClientError::MissingHash => None,
        }
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, ClientError::Api { code, .. } if code == "locked")
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ClientError::Api { code, .. } if code == "stale_version")
    }

    /// An add whose devices were all present already.
    pub fn is_unchanged(&self) -> bool {
        matches!(self, ClientError::Api { code, .. } if code == "unchanged")
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(150),
            max_delay: Duration::from_millis(1200),
        }
    }
}

/// A file and the token it had when it was read.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub hash: VersionToken,
}

pub struct RingBuilderClient {
    http: reqwest::Client,
    base_url: String,
    key: String,
    retry: RetryPolicy,
}

impl RingBuilderClient {
    pub fn new(base_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: key.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn fetch_builder(&self, category: Category) -> Result<Fetched> {
        let path = format!("{}/{}", ENDPOINT_BUILDER, category.builder_file());
        self.fetch(&path).await
    }

    pub async fn fetch_ring(&self, category: Category) -> Result<Fetched> {
        let path = format!("{}/{}", ENDPOINT_RING, category.ring_file());
        self.fetch(&path).await
    }

    /// Current catalog token without downloading the file.
    pub async fn builder_hash(&self, category: Category) -> Result<VersionToken> {
        let path = format!("{}/{}", ENDPOINT_BUILDER, category.builder_file());
        let response = self.send(|| self.request(Method::HEAD, &path)).await?;
        hash_of(&response)
    }

    pub async fn list(&self, category: Category) -> Result<ListResponse> {
        let path = format!("{}/{}/list", ENDPOINT_BUILDER, category);
        let response = self.send(|| self.request(Method::GET, &path)).await?;
        Ok(response.json().await?)
    }

    pub async fn search(&self, category: Category, value: &str) -> Result<SearchResponse> {
        let body = json!({ "value": value });
        self.post(category, "search", None, &body).await
    }

    pub async fn add(
        &self,
        category: Category,
        hash: &VersionToken,
        devices: &[DeviceSpec],
    ) -> Result<VersionToken> {
        let body = json!({ "devices": devices });
        let written: WriteResponse = self.post(category, "add", Some(hash), &body).await?;
        Ok(written.hash)
    }

    pub async fn remove(
        &self,
        category: Category,
        hash: &VersionToken,
        ids: &[DeviceId],
    ) -> Result<VersionToken> {
        let body = json!({ "devices": ids });
        let written: WriteResponse = self.post(category, "remove", Some(hash), &body).await?;
        Ok(written.hash)
    }

    pub async fn set_weight(
        &self,
        category: Category,
        hash: &VersionToken,
        weights: &BTreeMap<DeviceId, f64>,
    ) -> Result<VersionToken> {
        let body = json!({ "devices": weights });
        let written: WriteResponse = self.post(category, "weight", Some(hash), &body).await?;
        Ok(written.hash)
    }

    pub async fn set_meta(
        &self,
        category: Category,
        hash: &VersionToken,
        metas: &BTreeMap<DeviceId, String>,
    ) -> Result<VersionToken> {
        let body = json!({ "devices": metas });
        let written: WriteResponse = self.post(category, "meta", Some(hash), &body).await?;
        Ok(written.hash)
    }

    pub async fn rebalance(&self, category: Category, hash: &VersionToken) -> Result<RebalanceResponse> {
        self.post(category, "rebalance", Some(hash), &json!({})).await
    }

    async fn fetch(&self, path: &str) -> Result<Fetched> {
        let response = self.send(|| self.request(Method::GET, path)).await?;
        let hash = hash_of(&response)?;
        let bytes = response.bytes().await?.to_vec();
        Ok(Fetched { bytes, hash })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        category: Category,
        action: &str,
        hash: Option<&VersionToken>,
        body: &serde_json::Value,
    ) -> Result<T> {
        let path = format!("{}/{}/{}", ENDPOINT_BUILDER, category, action);
        let response = self
            .send(|| {
                let request = self.request(Method::POST, &path).json(body);
                match hash {
                    Some(hash) => request.header(HEADER_LAST_HASH, hash.as_str()),
                    None => request,
                }
            })
            .await?;
        Ok(response.json().await?)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header(HEADER_KEY, &self.key)
    }

    /// Sends the request built by `build`, rebuilding it for every retry.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut delay_ms = self.retry.base_delay.as_millis() as u64;
        let max_delay_ms = self.retry.max_delay.as_millis() as u64;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let last = attempt >= self.retry.attempts;
            match build().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let err = api_error(response).await;
                    if last || !err.is_lock_conflict() {
                        return Err(err);
                    }
                    tracing::debug!("Lock conflict on attempt {}, retrying", attempt);
                }
                Err(e) => {
                    if last {
                        return Err(e.into());
                    }
                    tracing::warn!("Request failed on attempt {}: {}", attempt, e);
                }
            }

            let jitter = rand::random::<u64>() % (delay_ms / 2 + 1);
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(max_delay_ms);
        }
    }
}

fn hash_of(response: &Response) -> Result<VersionToken> {
    response
        .headers()
        .get(HEADER_CURRENT_HASH)
        .and_then(|v| v.to_str().ok())
        .map(|v| VersionToken(v.to_string()))
        .ok_or(ClientError::MissingHash)
}

async fn api_error(response: Response) -> ClientError {
    let status = response.status();
    let hash = hash_of(&response).ok();
    let body = response.bytes().await.unwrap_or_default();
    let (message, code) = match serde_json::from_slice::<ErrorResponse>(&body) {
        Ok(parsed) => (parsed.error, parsed.code),
        Err(_) => (
            status.canonical_reason().unwrap_or("unknown error").to_string(),
            String::new(),
        ),
    };
    ClientError::Api {
        status,
        code,
        message,
        hash,
    }
}
