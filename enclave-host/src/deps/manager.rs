//! Per-plugin view over the dependency loader.

use super::loader::{DependencyInfo, DependencyLoader, DependencyResolution, ScriptTarget};
use crate::error::{HostError, HostResult};
use enclave_types::{LibraryDependency, LibraryKind, PluginId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::info;

struct PluginDependencies {
    target: Arc<dyn ScriptTarget>,
    resolutions: Vec<DependencyResolution>,
}

/// Tracks which libraries were loaded into which plugin's sandbox.
pub struct DependencyManager {
    loader: Arc<DependencyLoader>,
    plugins: RwLock<HashMap<PluginId, PluginDependencies>>,
}

impl DependencyManager {
    pub fn new(loader: Arc<DependencyLoader>) -> Self {
        Self {
            loader,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &Arc<DependencyLoader> {
        &self.loader
    }

    /// Loads a manifest's libraries into `target` in name order.
    ///
    /// Libraries loaded before a failure stay recorded so that
    /// [`Self::release_plugin`] can clean them up.
    pub async fn load_for_plugin(
        &self,
        plugin_id: &PluginId,
        target: Arc<dyn ScriptTarget>,
        libraries: &BTreeMap<String, LibraryDependency>,
    ) -> HostResult<Vec<DependencyResolution>> {
        self.plugins.write().unwrap().insert(
            plugin_id.clone(),
            PluginDependencies {
                target: target.clone(),
                resolutions: Vec::new(),
            },
        );

        for (name, library) in libraries {
            let info = DependencyInfo::from_library(name, library);
            let resolution = self.loader.load_dependency(target.as_ref(), &info).await?;
            if let Some(record) = self.plugins.write().unwrap().get_mut(plugin_id) {
                record.resolutions.push(resolution);
            }
        }

        let resolutions = self.resolutions(plugin_id);
        if !resolutions.is_empty() {
            info!(plugin_id = %plugin_id, count = resolutions.len(), "plugin libraries loaded");
        }
        Ok(resolutions)
    }

    /// Top-level libraries loaded for `plugin_id`.
    pub fn resolutions(&self, plugin_id: &PluginId) -> Vec<DependencyResolution> {
        self.plugins
            .read()
            .unwrap()
            .get(plugin_id)
            .map(|r| r.resolutions.clone())
            .unwrap_or_default()
    }

    /// Every npm library currently loaded, with the plugin that uses it.
    pub fn npm_resolutions(&self) -> Vec<(PluginId, DependencyResolution)> {
        let plugins = self.plugins.read().unwrap();
        let mut out: Vec<(PluginId, DependencyResolution)> = plugins
            .iter()
            .flat_map(|(id, record)| {
                record
                    .resolutions
                    .iter()
                    .filter(|r| r.kind == LibraryKind::Npm)
                    .map(move |r| (id.clone(), r.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        out
    }

    /// Loads `version` of `name` for a plugin, then unloads the version it
    /// replaces. Returns the old and new resolutions.
    pub async fn upgrade(
        &self,
        plugin_id: &PluginId,
        name: &str,
        version: &str,
    ) -> HostResult<(DependencyResolution, DependencyResolution)> {
        let (target, old) = {
            let plugins = self.plugins.read().unwrap();
            let record = plugins
                .get(plugin_id)
                .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
            let old = record
                .resolutions
                .iter()
                .find(|r| r.name == name)
                .cloned()
                .ok_or_else(|| HostError::Dependency {
                    name: name.to_string(),
                    version: version.to_string(),
                    message: format!("not loaded for plugin {plugin_id}"),
                })?;
            (record.target.clone(), old)
        };

        let info = DependencyInfo {
            name: name.to_string(),
            version: version.to_string(),
            kind: old.kind,
            url: None,
            integrity: None,
        };
        let new = self.loader.load_dependency(target.as_ref(), &info).await?;
        if new.version != old.version {
            self.loader
                .unload_dependency(target.as_ref(), &old.name, &old.version)
                .await?;
        }

        if let Some(record) = self.plugins.write().unwrap().get_mut(plugin_id) {
            for r in record.resolutions.iter_mut().filter(|r| r.name == name) {
                *r = new.clone();
            }
        }
        Ok((old, new))
    }

    /// Loads the libraries recorded for `plugin_id` into a replacement
    /// target without making it the plugin's target. On failure the
    /// replacement's bookkeeping is dropped.
    pub async fn load_into(
        &self,
        plugin_id: &PluginId,
        target: &dyn ScriptTarget,
    ) -> HostResult<Vec<DependencyResolution>> {
        let resolutions = self.resolutions(plugin_id);
        for resolution in &resolutions {
            let info = DependencyInfo {
                name: resolution.name.clone(),
                version: resolution.version.clone(),
                kind: resolution.kind,
                url: Some(resolution.url.clone()),
                integrity: resolution.integrity.clone(),
            };
            if let Err(e) = self.loader.load_dependency(target, &info).await {
                self.loader.forget_target(target.target_id());
                return Err(e);
            }
        }
        Ok(resolutions)
    }

    /// Makes `target` the plugin's target and drops the previous one's
    /// bookkeeping. Returns false if nothing is recorded for `plugin_id`.
    pub fn retarget(&self, plugin_id: &PluginId, target: Arc<dyn ScriptTarget>) -> bool {
        let previous = {
            let mut plugins = self.plugins.write().unwrap();
            let Some(record) = plugins.get_mut(plugin_id) else {
                return false;
            };
            std::mem::replace(&mut record.target, target)
        };
        self.loader.forget_target(previous.target_id());
        true
    }

    /// Forgets a plugin whose sandbox is gone. Cached content stays.
    pub fn release_plugin(&self, plugin_id: &PluginId) -> bool {
        let Some(record) = self.plugins.write().unwrap().remove(plugin_id) else {
            return false;
        };
        self.loader.forget_target(record.target.target_id());
        true
    }
}
