//! Fetches, verifies, caches and injects third-party scripts.

use super::registry::Registry;
use crate::config::DependencySettings;
use crate::error::{HostError, HostResult};
use crate::events::{DependencyEvent, EventBus};
use async_trait::async_trait;
use enclave_crypto::Integrity;
use enclave_sdk::{ScriptElement, ScriptSource};
use enclave_types::{FetchError, Fetcher, LibraryDependency, LibraryKind};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// A context scripts can be injected into.
#[async_trait]
pub trait ScriptTarget: Send + Sync {
    /// Distinguishes targets in the loaded-script bookkeeping.
    fn target_id(&self) -> &str;

    async fn inject_script(&self, element: ScriptElement) -> HostResult<()>;

    async fn remove_element(&self, id: &str) -> HostResult<()>;
}

/// A dependency as requested, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyInfo {
    pub name: String,
    /// Exact version, or a range for npm packages.
    pub version: String,
    pub kind: LibraryKind,
    pub url: Option<String>,
    pub integrity: Option<String>,
}

impl DependencyInfo {
    pub fn npm(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind: LibraryKind::Npm,
            url: None,
            integrity: None,
        }
    }

    pub fn from_library(name: &str, library: &LibraryDependency) -> Self {
        Self {
            name: name.to_string(),
            version: library.version.clone(),
            kind: library.kind,
            url: library.url.clone(),
            integrity: library.integrity.clone(),
        }
    }
}

/// A dependency pinned to one version and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyResolution {
    pub name: String,
    pub version: String,
    pub url: String,
    pub integrity: Option<String>,
    pub kind: LibraryKind,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

impl DependencyResolution {
    /// Id of the script element this dependency is injected as.
    pub fn element_id(&self) -> String {
        element_id(&self.name, &self.version)
    }
}

pub fn element_id(name: &str, version: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
            .collect()
    };
    format!("dep-{}-{}", clean(name), clean(version))
}

#[derive(Debug)]
struct CachedScript {
    resolution: DependencyResolution,
    source: String,
}

type PairKey = (String, String);
type LoadedKey = (String, String, String);

/// Named async locks. An entry lives only while someone holds or awaits it.
#[derive(Default)]
struct Guards(Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>);

impl Guards {
    async fn acquire(&self, key: String) -> Held<'_> {
        let lock = self.0.lock().unwrap().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        Held {
            guards: self,
            key,
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

struct Held<'a> {
    guards: &'a Guards,
    key: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.guards.0.lock().unwrap();
        if locks.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.key);
        }
    }
}

pub struct DependencyLoader {
    fetcher: Arc<dyn Fetcher>,
    registry: Arc<Registry>,
    integrity_suffix: String,
    require_integrity: bool,
    /// Verified content by (name, resolved version).
    content: RwLock<HashMap<PairKey, Arc<CachedScript>>>,
    /// Requested (name, version or range) to resolved version.
    aliases: RwLock<HashMap<PairKey, String>>,
    /// Injected scripts by (target, name, version).
    loaded: Mutex<HashMap<LoadedKey, DependencyResolution>>,
    guards: Guards,
    events: EventBus<DependencyEvent>,
}

impl DependencyLoader {
    pub fn new(fetcher: Arc<dyn Fetcher>, settings: &DependencySettings) -> Self {
        Self {
            registry: Arc::new(Registry::new(fetcher.clone(), settings)),
            fetcher,
            integrity_suffix: settings.integrity_suffix.clone(),
            require_integrity: settings.require_integrity,
            content: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
            guards: Guards::default(),
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<DependencyEvent> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_loaded(&self, target_id: &str, name: &str, version: &str) -> bool {
        self.loaded.lock().unwrap().contains_key(&(
            target_id.to_string(),
            name.to_string(),
            version.to_string(),
        ))
    }

    /// Cached content for an exact version.
    pub fn cached(&self, name: &str, version: &str) -> Option<String> {
        self.content
            .read()
            .unwrap()
            .get(&(name.to_string(), version.to_string()))
            .map(|c| c.source.clone())
    }

    pub fn cache_len(&self) -> usize {
        self.content.read().unwrap().len()
    }

    /// Guards currently held or awaited by loads in flight.
    pub fn in_flight(&self) -> usize {
        self.guards.len()
    }

    /// Everything injected into `target_id`, sorted by name.
    pub fn loaded_into(&self, target_id: &str) -> Vec<DependencyResolution> {
        let mut out: Vec<DependencyResolution> = self
            .loaded
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, _, _), _)| t == target_id)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        out
    }

    /// Loads `info` and its sub-dependencies into `target`.
    pub async fn load_dependency(
        &self,
        target: &dyn ScriptTarget,
        info: &DependencyInfo,
    ) -> HostResult<DependencyResolution> {
        self.load_in_chain(target, info.clone(), Vec::new()).await
    }

    fn load_in_chain<'a>(
        &'a self,
        target: &'a dyn ScriptTarget,
        info: DependencyInfo,
        chain: Vec<String>,
    ) -> BoxFuture<'a, HostResult<DependencyResolution>> {
        Box::pin(async move {
            self.events.emit(DependencyEvent::Loading {
                name: info.name.clone(),
                version: info.version.clone(),
            });
            let result = self.load_steps(target, &info, chain).await;
            match &result {
                Ok(resolution) => {
                    self.events.emit(DependencyEvent::Loaded {
                        name: resolution.name.clone(),
                        version: resolution.version.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        name = %info.name,
                        version = %info.version,
                        error = %e,
                        "dependency load failed"
                    );
                    self.events.emit(DependencyEvent::Error {
                        name: info.name.clone(),
                        version: info.version.clone(),
                        message: e.to_string(),
                    });
                }
            }
            result
        })
    }

    async fn load_steps(
        &self,
        target: &dyn ScriptTarget,
        info: &DependencyInfo,
        mut chain: Vec<String>,
    ) -> HostResult<DependencyResolution> {
        let cached = self.ensure_cached(info).await?;

        chain.push(info.name.clone());
        for (name, range) in &cached.resolution.dependencies {
            if chain.contains(name) {
                debug!(name = %name, parent = %info.name, "skipping circular dependency");
                continue;
            }
            self.load_in_chain(target, DependencyInfo::npm(name, range), chain.clone())
                .await?;
        }

        self.inject(target, &cached).await
    }

    fn lookup(&self, name: &str, requested: &str) -> Option<Arc<CachedScript>> {
        let key = (name.to_string(), requested.to_string());
        let version = self
            .aliases
            .read()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| requested.to_string());
        self.content
            .read()
            .unwrap()
            .get(&(name.to_string(), version))
            .cloned()
    }

    /// Resolves, fetches and verifies `info` once per (name, version).
    ///
    /// Identical requests serialize on the requested version; requests
    /// resolving to the same version then serialize on the fetch.
    async fn ensure_cached(&self, info: &DependencyInfo) -> HostResult<Arc<CachedScript>> {
        let _request = self
            .guards
            .acquire(format!("request:{}@{}", info.name, info.version))
            .await;
        if let Some(hit) = self.lookup(&info.name, &info.version) {
            return Ok(hit);
        }

        let mut resolution = self.resolve(info).await?;
        let alias = (info.name.clone(), info.version.clone());
        let pair = (resolution.name.clone(), resolution.version.clone());
        let _fetch = self
            .guards
            .acquire(format!("fetch:{}@{}", pair.0, pair.1))
            .await;
        if let Some(hit) = self.content.read().unwrap().get(&pair).cloned() {
            self.aliases.write().unwrap().insert(alias, resolution.version);
            return Ok(hit);
        }

        debug!(
            name = %resolution.name,
            version = %resolution.version,
            url = %resolution.url,
            "fetching dependency"
        );
        let source = self.fetcher.get(&resolution.url).await?.text()?;

        let integrity = match resolution.integrity.take() {
            Some(declared) => Some(declared),
            None => self.fetch_digest(&resolution.url).await?,
        };
        match &integrity {
            Some(value) => Integrity::parse(value)
                .and_then(|i| i.verify(source.as_bytes()))
                .map_err(|err| HostError::Integrity {
                    name: resolution.name.clone(),
                    version: resolution.version.clone(),
                    source: err,
                })?,
            None if self.require_integrity => {
                return Err(HostError::Dependency {
                    name: resolution.name,
                    version: resolution.version,
                    message: "no integrity digest available".into(),
                });
            }
            None => {
                warn!(
                    name = %resolution.name,
                    version = %resolution.version,
                    "loading dependency without integrity check"
                );
            }
        }
        resolution.integrity = integrity;

        let cached = Arc::new(CachedScript { resolution, source });
        self.content.write().unwrap().insert(pair, cached.clone());
        self.aliases
            .write()
            .unwrap()
            .insert(alias, cached.resolution.version.clone());
        Ok(cached)
    }

    async fn resolve(&self, info: &DependencyInfo) -> HostResult<DependencyResolution> {
        match info.kind {
            LibraryKind::Npm => {
                let meta = self.registry.metadata(&info.name).await?;
                let version = meta.max_satisfying(&info.version)?;
                let url = info
                    .url
                    .clone()
                    .unwrap_or_else(|| self.registry.file_url(&info.name, &version));
                Ok(DependencyResolution {
                    name: info.name.clone(),
                    version: version.to_string(),
                    url,
                    integrity: info.integrity.clone(),
                    kind: info.kind,
                    dependencies: meta.dependencies(&version),
                })
            }
            LibraryKind::Umd | LibraryKind::Esm => {
                let url = info.url.clone().ok_or_else(|| HostError::Dependency {
                    name: info.name.clone(),
                    version: info.version.clone(),
                    message: "a url is required for umd and esm libraries".into(),
                })?;
                Ok(DependencyResolution {
                    name: info.name.clone(),
                    version: info.version.clone(),
                    url,
                    integrity: info.integrity.clone(),
                    kind: info.kind,
                    dependencies: BTreeMap::new(),
                })
            }
        }
    }

    /// The digest document published next to `url`. Only a 404 or an
    /// empty document means none is published; other failures are errors.
    async fn fetch_digest(&self, url: &str) -> HostResult<Option<String>> {
        let digest_url = format!("{url}{}", self.integrity_suffix);
        match self.fetcher.get(&digest_url).await.and_then(|r| r.text()) {
            Ok(text) if !text.trim().is_empty() => Ok(Some(text.trim().to_string())),
            Ok(_) => Ok(None),
            Err(FetchError::Status { status: 404, .. }) => {
                debug!(url = %digest_url, "no digest document");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn inject(
        &self,
        target: &dyn ScriptTarget,
        cached: &CachedScript,
    ) -> HostResult<DependencyResolution> {
        let resolution = &cached.resolution;
        let key = (
            target.target_id().to_string(),
            resolution.name.clone(),
            resolution.version.clone(),
        );
        let _held = self
            .guards
            .acquire(format!("inject:{}:{}@{}", key.0, key.1, key.2))
            .await;

        if let Some(existing) = self.loaded.lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }

        let element = ScriptElement {
            id: resolution.element_id(),
            source: ScriptSource::Inline(cached.source.clone()),
            integrity: resolution.integrity.clone(),
            cross_origin: resolution.integrity.as_ref().map(|_| "anonymous".to_string()),
            module: resolution.kind == LibraryKind::Esm,
        };
        target.inject_script(element).await?;

        info!(
            target = %key.0,
            name = %resolution.name,
            version = %resolution.version,
            "dependency loaded"
        );
        self.loaded.lock().unwrap().insert(key, resolution.clone());
        Ok(resolution.clone())
    }

    /// Removes the script element and cached content. Effects the script
    /// already had on the target are not undone.
    pub async fn unload_dependency(
        &self,
        target: &dyn ScriptTarget,
        name: &str,
        version: &str,
    ) -> HostResult<bool> {
        let key = (
            target.target_id().to_string(),
            name.to_string(),
            version.to_string(),
        );
        let was_loaded = self.loaded.lock().unwrap().remove(&key).is_some();
        if was_loaded {
            target.remove_element(&element_id(name, version)).await?;
        }
        self.forget_content(name, version);
        debug!(target = %key.0, name, version, "dependency unloaded");
        Ok(was_loaded)
    }

    fn forget_content(&self, name: &str, version: &str) {
        self.content
            .write()
            .unwrap()
            .remove(&(name.to_string(), version.to_string()));
        self.aliases
            .write()
            .unwrap()
            .retain(|(n, _), v| !(n == name && v == version));
    }

    /// Drops bookkeeping for a target whose context is gone.
    pub fn forget_target(&self, target_id: &str) -> usize {
        let mut loaded = self.loaded.lock().unwrap();
        let before = loaded.len();
        loaded.retain(|(t, _, _), _| t != target_id);
        before - loaded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_ids_are_stable_and_safe() {
        assert_eq!(element_id("lodash", "4.17.21"), "dep-lodash-4-17-21");
        assert_eq!(element_id("@acme/ui", "1.0.0-rc.1"), "dep--acme-ui-1-0-0-rc-1");
    }

    #[test]
    fn info_from_library() {
        let lib = LibraryDependency {
            version: "3.7.0".into(),
            kind: LibraryKind::Umd,
            url: Some("https://cdn.test/d3.js".into()),
            integrity: None,
        };
        let info = DependencyInfo::from_library("d3", &lib);
        assert_eq!(info.name, "d3");
        assert_eq!(info.kind, LibraryKind::Umd);
        assert_eq!(info.url.as_deref(), Some("https://cdn.test/d3.js"));
    }
}
