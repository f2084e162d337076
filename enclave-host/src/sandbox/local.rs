//! In-process isolation backend.
//!
//! Each container is an [`enclave_sdk::GuestRuntime`] on its own tokio
//! task. The only link to the host is the message port in the
//! [`ContainerSpec`] and the control channel behind [`GuestHandle`].

use crate::error::{HostError, HostResult};
use crate::sandbox::backend::{Container, ContainerCommand, ContainerSpec, IsolationBackend};
use async_trait::async_trait;
use enclave_sdk::{ControlMessage, GuestHandle, GuestRuntime, GuestSpec, ScriptEngine};
use enclave_storage::KeyValueStore;
use enclave_types::{FetchError, FetchRequest, FetchResponse, Fetcher};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

const BLOB_SCHEME: &str = "blob:";

/// Object URLs for in-memory content.
#[derive(Clone, Default)]
pub struct BlobRegistry {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl BlobRegistry {
    pub fn publish(&self, bytes: Vec<u8>) -> String {
        let url = format!("{BLOB_SCHEME}enclave/{}", Uuid::new_v4());
        self.blobs.lock().unwrap().insert(url.clone(), bytes);
        url
    }

    pub fn revoke(&self, url: &str) -> bool {
        self.blobs.lock().unwrap().remove(url).is_some()
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serves `blob:` URLs from the registry and everything else from `inner`.
struct BlobFetcher {
    blobs: BlobRegistry,
    inner: Arc<dyn Fetcher>,
}

#[async_trait]
impl Fetcher for BlobFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        if !request.url.starts_with(BLOB_SCHEME) {
            return self.inner.fetch(request).await;
        }
        match self.blobs.get(&request.url) {
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

pub struct LocalBackend {
    engine: Arc<dyn ScriptEngine>,
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn KeyValueStore>,
    blobs: BlobRegistry,
}

impl LocalBackend {
    /// `fetcher` backs guest network access; `storage` backs plugin state.
    pub fn new(
        engine: Arc<dyn ScriptEngine>,
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            engine,
            fetcher,
            storage,
            blobs: BlobRegistry::default(),
        }
    }

    pub fn blobs(&self) -> &BlobRegistry {
        &self.blobs
    }
}

#[async_trait]
impl IsolationBackend for LocalBackend {
    async fn create(&self, spec: ContainerSpec) -> HostResult<Box<dyn Container>> {
        debug!(
            plugin_id = %spec.plugin_id,
            origin = %spec.origin,
            capabilities = ?spec.capabilities,
            "creating local container"
        );
        let handle = GuestRuntime::spawn(GuestSpec {
            plugin_id: spec.plugin_id,
            permissions: spec.permissions,
            port: spec.port,
            ipc: spec.ipc,
            rpc: spec.rpc,
            engine: self.engine.clone(),
            fetcher: Arc::new(BlobFetcher {
                blobs: self.blobs.clone(),
                inner: self.fetcher.clone(),
            }),
            storage: self.storage.clone(),
        });
        Ok(Box::new(LocalContainer {
            handle,
            blobs: self.blobs.clone(),
            published: Mutex::new(Vec::new()),
        }))
    }
}

struct LocalContainer {
    handle: GuestHandle,
    blobs: BlobRegistry,
    published: Mutex<Vec<String>>,
}

#[async_trait]
impl Container for LocalContainer {
    async fn loaded(&mut self) -> HostResult<()> {
        Ok(self.handle.loaded().await?)
    }

    async fn execute(&self, command: ContainerCommand) -> HostResult<()> {
        let result = match command {
            ContainerCommand::WriteDocument(source) => {
                self.handle
                    .request(|ack| ControlMessage::WriteDocument { source, ack })
                    .await
            }
            ContainerCommand::LoadUrl(url) => {
                self.handle
                    .request(|ack| ControlMessage::LoadUrl { url, ack })
                    .await
            }
            ContainerCommand::ApplyCsp(policy) => {
                self.handle
                    .request(|ack| ControlMessage::ApplyCsp { policy, ack })
                    .await
            }
            ContainerCommand::InstallReporter(interval) => {
                self.handle
                    .request(|ack| ControlMessage::InstallReporter { interval, ack })
                    .await
            }
            ContainerCommand::InjectScript(element) => {
                self.handle
                    .request(|ack| ControlMessage::InjectScript { element, ack })
                    .await
            }
            ContainerCommand::InjectStyles { id, css } => {
                self.handle
                    .request(|ack| ControlMessage::InjectStyles { id, css, ack })
                    .await
            }
            ContainerCommand::RemoveElement(id) => {
                self.handle
                    .request(|ack| ControlMessage::RemoveElement { id, ack })
                    .await
            }
        };
        result.map_err(HostError::from)
    }

    fn publish_blob(&self, bytes: Vec<u8>) -> String {
        let url = self.blobs.publish(bytes);
        self.published.lock().unwrap().push(url.clone());
        url
    }

    fn revoke_blob(&self, url: &str) {
        self.blobs.revoke(url);
        self.published.lock().unwrap().retain(|u| u != url);
    }

    async fn detach(&mut self) -> HostResult<()> {
        let result = self
            .handle
            .request(|ack| ControlMessage::Detach { ack })
            .await;
        for url in self.published.lock().unwrap().drain(..) {
            self.blobs.revoke(&url);
        }
        if self.handle.is_running() {
            self.handle.abort();
        }
        result.map_err(HostError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_types::StaticFetcher;

    #[tokio::test]
    async fn blob_fetcher_resolves_published_urls() {
        let blobs = BlobRegistry::default();
        let inner = Arc::new(StaticFetcher::new());
        inner.route("https://cdn.test/a.js", "a");
        let fetcher = BlobFetcher {
            blobs: blobs.clone(),
            inner: inner.clone(),
        };

        let url = blobs.publish(b"entry".to_vec());
        assert!(url.starts_with("blob:enclave/"));
        assert_eq!(fetcher.get(&url).await.unwrap().body, b"entry");
        assert_eq!(fetcher.get("https://cdn.test/a.js").await.unwrap().body, b"a");

        assert!(blobs.revoke(&url));
        assert!(matches!(
            fetcher.get(&url).await,
            Err(FetchError::Status { status: 404, .. })
        ));
        assert_eq!(inner.total_hits(), 1);
    }
}
