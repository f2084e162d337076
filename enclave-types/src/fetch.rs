//! Network abstraction shared by the dependency loader and guest contexts.
//!
//! The host ships an HTTP implementation; [`StaticFetcher`] serves fixed
//! bodies from memory and counts requests, which is what tests and offline
//! hosts use.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Errors returned by a [`Fetcher`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            body: None,
        }
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn text(&self) -> Result<String, FetchError> {
        String::from_utf8(self.body.clone()).map_err(|e| FetchError::Decode {
            url: self.url.clone(),
            message: e.to_string(),
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode {
            url: self.url.clone(),
            message: e.to_string(),
        })
    }
}

/// Performs outbound requests. Non-2xx responses are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;

    async fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.fetch(FetchRequest::get(url)).await
    }
}

/// In-memory fetcher serving registered bodies.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    routes: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, u16>>,
    hits: Mutex<HashMap<String, usize>>,
    latency: Option<Duration>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response, to widen race windows in tests.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Serves `body` for `url` (any method).
    pub fn route(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> &Self {
        let url = url.into();
        self.failures.lock().unwrap().remove(&url);
        self.routes.lock().unwrap().insert(url, body.into());
        self
    }

    /// Serves `value` serialized as JSON.
    pub fn route_json(&self, url: impl Into<String>, value: &serde_json::Value) -> &Self {
        self.route(url, value.to_string())
    }

    pub fn unroute(&self, url: &str) {
        self.routes.lock().unwrap().remove(url);
    }

    /// Answers `url` with `status` until it is routed again.
    pub fn fail(&self, url: impl Into<String>, status: u16) -> &Self {
        let url = url.into();
        self.routes.lock().unwrap().remove(&url);
        self.failures.lock().unwrap().insert(url, status);
        self
    }

    /// Number of requests made for `url`, including 404s.
    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        *self
            .hits
            .lock()
            .unwrap()
            .entry(request.url.clone())
            .or_default() += 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(&status) = self.failures.lock().unwrap().get(&request.url) {
            return Err(FetchError::Status {
                url: request.url,
                status,
            });
        }
        let body = self.routes.lock().unwrap().get(&request.url).cloned();
        match body {
            Some(body) => Ok(FetchResponse {
                url: request.url,
                status: 200,
                body,
            }),
            None => Err(FetchError::Status {
                url: request.url,
                status: 404,
            }),
        }
    }
}
