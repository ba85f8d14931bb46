//! Outbound side: the remote resource server.
//!
//! The engine only sees the `RemoteSource` trait. `HttpRemote` is the
//! reqwest-backed implementation used by the CLI.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Response, Url};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::error::FetchError;
use crate::key::ResourceKey;

/// HTTP request timeout in seconds.
/// The engine also bounds each attempt; this only guards the raw socket.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Field the server uses to report when a resource last changed.
const UPDATED_AT_FIELD: &str = "updatedAt";

/// Fires when the owning engine shuts down.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl AbortSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once aborted. Pending forever if the sender goes away
    /// without aborting.
    pub async fn aborted(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let fired = rx.wait_for(|aborted| *aborted).await.is_ok();
            if fired {
                return;
            }
        }
        futures::future::pending::<()>().await;
    }
}

/// Remote state of a resource, used to detect replay conflicts.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerState {
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
    async fn fetch(&self, key: &ResourceKey, abort: AbortSignal) -> Result<Value, FetchError>;

    async fn mutate(&self, tag: &str, variables: &Value) -> Result<Value, FetchError>;

    /// Current server-side state of `key`, if the server tracks update times.
    async fn server_state(&self, _key: &ResourceKey) -> Result<Option<ServerState>, FetchError> {
        Ok(None)
    }
}

/// JSON-over-HTTP remote.
///
/// `GET {base}/{segment}/{segment}...` reads a resource,
/// `POST {base}/mutations/{tag}` applies a mutation.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("Invalid server URL: {}", base_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Server URL cannot carry a path: {}", base_url);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base,
            token: None,
        })
    }

    /// Create a new HttpRemote with the given bearer token, sharing the
    /// connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    /// The base URL with `segments` appended, each percent-encoded.
    fn url_for<I>(&self, segments: I) -> Url
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn resource_url(&self, key: &ResourceKey) -> Url {
        self.url_for(key.segments().iter().map(|s| s.to_string()))
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, FetchError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| FetchError::InvalidResponse(format!("Invalid token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, FetchError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(FetchError::from_status(status.as_u16(), &body))
        }
    }

    async fn get_json(&self, url: Url) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .headers(self.auth_headers()?)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn fetch(&self, key: &ResourceKey, mut abort: AbortSignal) -> Result<Value, FetchError> {
        let url = self.resource_url(key);
        debug!(url = %url, "GET");
        tokio::select! {
            result = self.get_json(url) => result,
            _ = abort.aborted() => Err(FetchError::Aborted),
        }
    }

    async fn mutate(&self, tag: &str, variables: &Value) -> Result<Value, FetchError> {
        let url = self.url_for(["mutations", tag]);
        debug!(url = %url, "POST");
        let response = self
            .client
            .post(url)
            .headers(self.auth_headers()?)
            .json(variables)
            .send()
            .await?;
        let response = Self::check_response(response).await?;

        // Mutations may legitimately return an empty body.
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| FetchError::InvalidResponse(e.to_string()))
    }

    async fn server_state(&self, key: &ResourceKey) -> Result<Option<ServerState>, FetchError> {
        let payload = match self.get_json(self.resource_url(key)).await {
            Ok(payload) => payload,
            Err(FetchError::Client { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let updated_at = payload
            .get(UPDATED_AT_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(updated_at.map(|updated_at| ServerState { payload, updated_at }))
    }
}
