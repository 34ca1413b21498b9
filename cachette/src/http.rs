//! HTTP download-through-cache.
//!
//! [`HttpService`] owns a [`reqwest::Client`] and downloads URLs through a
//! byte-level [`BlobStore`]: a live cached body short-circuits the network,
//! anything else performs the request, caches the body on success, and
//! returns it. Response bodies are decompressed by the client before they
//! are cached.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cachette::{DownloadRequest, Expiration, HttpService, MemoryStore, SystemClock};
//!
//! # #[tokio::main]
//! # async fn main() -> cachette::Result<()> {
//! let store = MemoryStore::new(Arc::new(SystemClock));
//! let http = HttpService::new();
//!
//! let request = DownloadRequest::get("https://example.com/feed.json")
//!     .expiration(Expiration::After(Duration::from_secs(600)));
//! let body = http.download_url(&store, request).await?;
//! println!("downloaded {} bytes", body.len());
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use reqwest::Method;

use crate::config::Expiration;
use crate::error::{Error, Result};
use crate::store::{BlobStore, ensure_valid_key};

/// A cacheable download: the URL, the request shape, and the caching policy.
///
/// The cache key defaults to the URL itself; give an explicit
/// [`key`](Self::key) to share one cached body between several request
/// shapes or to control invalidation.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    method: Method,
    url: String,
    key: Option<String>,
    headers: Vec<(String, String)>,
    fetch_always: bool,
    expiration: Expiration,
}

impl DownloadRequest {
    /// A request with an explicit HTTP method.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            key: None,
            headers: Vec::new(),
            fetch_always: false,
            expiration: Expiration::Never,
        }
    }

    /// A GET request for `url`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Caches the body under `key` instead of the URL.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// When `true`, the request is issued even when a live cached body
    /// exists; the fresh body replaces it.
    #[must_use]
    pub fn fetch_always(mut self, fetch_always: bool) -> Self {
        self.fetch_always = fetch_always;
        self
    }

    /// Expiration applied to the cached body.
    #[must_use]
    pub fn expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    fn cache_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.url)
    }
}

/// Owns the HTTP client used to download bodies into a cache. Multiple
/// instances are fine; clones share the underlying client.
#[derive(Debug, Clone, Default)]
pub struct HttpService {
    client: reqwest::Client,
}

impl HttpService {
    /// A service with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A service reusing an existing client (custom timeouts, proxies, TLS
    /// configuration).
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Downloads `request`'s URL through `store`.
    ///
    /// A live cached body under the request's cache key is returned without
    /// touching the network unless
    /// [`fetch_always`](DownloadRequest::fetch_always) is set. On a
    /// successful (2xx) response the full body is cached under the key with
    /// the request's expiration and returned. Failures (transport errors,
    /// non-2xx statuses) propagate and leave the cache untouched.
    ///
    /// # Errors
    ///
    /// [`Error::ArgumentInvalid`] for an empty URL or key,
    /// [`Error::Http`] / [`Error::HttpStatus`] for request failures.
    pub async fn download_url(
        &self,
        store: &dyn BlobStore,
        request: DownloadRequest,
    ) -> Result<Bytes> {
        if request.url.is_empty() {
            return Err(Error::invalid_argument("download URL must not be empty"));
        }
        let key = request.cache_key().to_owned();
        ensure_valid_key(&key)?;

        if !request.fetch_always {
            match store.get(&key).await {
                Ok(cached) => {
                    tracing::debug!(%key, "serving download from cache");
                    return Ok(Bytes::from(cached));
                }
                Err(err) if err.is_key_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        tracing::debug!(url = %request.url, method = %request.method, "downloading");
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus(status));
        }
        let body = response.bytes().await?;

        store
            .insert(&key, body.to_vec(), None, request.expiration)
            .await?;
        Ok(body)
    }
}
