//! HTTP implementation of [`Fetcher`].

use async_trait::async_trait;
use enclave_types::{FetchError, FetchRequest, FetchResponse, Fetcher};
use reqwest::{Client, Method};
use std::time::Duration;

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Enclave/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: format!("http client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = request.url.clone();
        let network = |e: reqwest::Error| FetchError::Network {
            url: url.clone(),
            message: e.to_string(),
        };

        let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            FetchError::Network {
                url: url.clone(),
                message: format!("invalid method: {e}"),
            }
        })?;
        let mut builder = self.client.request(method, &request.url);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(network)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: request.url,
                status: status.as_u16(),
            });
        }
        let body = resp.bytes().await.map_err(network)?;
        Ok(FetchResponse {
            url: request.url,
            status: status.as_u16(),
            body: body.to_vec(),
        })
    }
}
